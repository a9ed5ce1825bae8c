// src/pipeline.rs - Per-image orchestration: segmentation, ROI clipping, skeleton and proximity analysis

use log::{debug, info, warn};
use ndarray::Array3;
use std::path::Path;

use crate::clip::{filter_objects_by_centroid, VolumeClipper};
use crate::composite::CompositeVolume;
use crate::config::AnalysisConfig;
use crate::distance::{DistanceTransformer, ExactEdt};
use crate::errors::Result;
use crate::image_io::{load_calibration, load_stack, ImageEntry};
use crate::morphology::skeletonize;
use crate::object3d::ObjectPopulation;
use crate::output::{write_branch_rows, write_cell_rows, write_global_rows, GlobalColumns};
use crate::proximity::ProximityClassifier;
use crate::results::{ResultsAggregator, RoiMeasurements};
use crate::roi::{load_tracks, RoiTrack};
use crate::segmentation::{SegmentationStrategy, SizeRange};
use crate::skeleton_graph::{prune_short_branches, SkeletonGraph};
use crate::volume::{check_same_shape, count_foreground, BinaryVolume, Calibration, Idx3d};

/// Segmented channels of one image
#[derive(Debug, Clone)]
pub struct SegmentedImage {
    pub name: String,
    pub calibration: Calibration,
    pub shape: Idx3d,
    pub vessels: ObjectPopulation,
    pub cells: Option<ObjectPopulation>,
    pub nuclei: Option<ObjectPopulation>,
}

/// Whole-image products shared by every ROI of an image
#[derive(Debug, Clone)]
pub struct ImageAnalysis {
    pub results: ResultsAggregator,
    pub vessel_mask: BinaryVolume,
    pub skeleton: BinaryVolume,
}

fn load_channel(
    entry: &ImageEntry,
    channel: &str,
    shape: Idx3d,
    strategy: &SegmentationStrategy,
    size: SizeRange,
    calibration: Calibration,
) -> Result<ObjectPopulation> {
    let raw = load_stack(entry.dir.join(channel))?;
    check_same_shape(shape, raw.dim(), channel)?;
    Ok(strategy.segment(&raw, calibration, size))
}

/// Load and segment every configured channel of an image
pub fn load_image(entry: &ImageEntry, config: &AnalysisConfig) -> Result<SegmentedImage> {
    let calibration = load_calibration(&entry.dir, config.default_calibration())?;
    calibration.validate()?;

    let raw = load_stack(entry.dir.join(&config.vessel_channel))?;
    let shape = raw.dim();
    let vessels = config
        .vessel_segmentation
        .segment(&raw, calibration, config.vessel_size());
    drop(raw);

    let cells = match &config.microglia_channel {
        Some(channel) => Some(load_channel(
            entry,
            channel,
            shape,
            &config.microglia_segmentation,
            config.microglia_size(),
            calibration,
        )?),
        None => None,
    };

    let nuclei = match &config.nuclei_channel {
        Some(channel) => {
            let mut nuclei = load_channel(
                entry,
                channel,
                shape,
                &config.nuclei_segmentation,
                config.nucleus_size(),
                calibration,
            )?;
            if config.drop_single_plane_nuclei {
                nuclei.filter_single_plane();
            }
            Some(nuclei)
        }
        None => None,
    };

    info!(
        "{}: {:?} voxels at {:.3}x{:.3} µm, {} vessel objects, {} cells, {} nuclei",
        entry.name,
        shape,
        calibration.pixel_width_um,
        calibration.pixel_depth_um,
        vessels.len(),
        cells.as_ref().map_or(0, |c| c.len()),
        nuclei.as_ref().map_or(0, |n| n.len()),
    );

    Ok(SegmentedImage {
        name: entry.name.clone(),
        calibration,
        shape,
        vessels,
        cells,
        nuclei,
    })
}

/// Skeleton of the whole vessel mask, pruned once when configured
pub fn vessel_skeleton(vessel_mask: &BinaryVolume, calibration: &Calibration, config: &AnalysisConfig) -> BinaryVolume {
    let skeleton = skeletonize(vessel_mask);
    if !config.prune_skeleton {
        return skeleton;
    }

    let (pruned, removed) = prune_short_branches(&skeleton, calibration, config.min_branch_length_um);
    debug!(
        "Pruned {} branches shorter than {} µm",
        removed, config.min_branch_length_um
    );
    pruned
}

/// Measure one ROI.
///
/// `next_label` is the first cell label available to this ROI; the returned
/// counter is the first label left for the next ROI of the image.
pub fn process_roi(
    image: &SegmentedImage,
    vessel_mask: &BinaryVolume,
    skeleton: &BinaryVolume,
    track: &RoiTrack,
    config: &AnalysisConfig,
    next_label: u32,
) -> (RoiMeasurements, u32) {
    let calibration = image.calibration;
    let (_, height, width) = image.shape;

    let clipper = VolumeClipper::new(track, 0.0, &calibration);
    let vessel_in_roi = clipper.clip(vessel_mask);
    let vessel_volume = count_foreground(&vessel_in_roi) as f64 * calibration.voxel_volume();
    let roi_volume = track.volume(width, height, &calibration);

    // Distances near the ROI border still see vessels just outside it
    let dilated = VolumeClipper::new(track, config.roi_dilation_um, &calibration);
    if config.roi_dilation_um > 0.0 && dilated.covers_image(width, height) && !clipper.covers_image(width, height) {
        warn!(
            "ROI {} dilated by {} µm covers the whole image",
            track.name(),
            config.roi_dilation_um
        );
    }
    let vessel_dilated = dilated.clip(vessel_mask);
    let normal = ExactEdt.normal(&vessel_dilated, &calibration);

    let graph = SkeletonGraph::build(&clipper.clip(skeleton), calibration);
    let metrics = graph.metrics(&normal);
    let branches = if config.write_branch_details {
        graph.branch_stats(&normal)
    } else {
        Vec::new()
    };

    let (cells, next_label) = match &image.cells {
        Some(population) => {
            let mut in_roi = filter_objects_by_centroid(population, track);
            let next = in_roi.relabel_from(next_label);

            let inverse = ExactEdt.inverse(&vessel_dilated, &calibration);
            let classifier = ProximityClassifier::with_fields(
                vessel_dilated,
                &dilated.clip(skeleton),
                vessel_volume,
                calibration,
                normal,
                inverse,
            );
            let (records, tally) = classifier.classify_population(&in_roi);
            debug!(
                "ROI {}: {} cells, VAM {} VTM {} VDM {}",
                track.name(),
                records.len(),
                tally.vam,
                tally.vtm,
                tally.vdm
            );
            (Some(records), next)
        }
        None => (None, next_label),
    };

    let nuclei_count = image
        .nuclei
        .as_ref()
        .map(|nuclei| filter_objects_by_centroid(nuclei, track).len());

    info!(
        "ROI {}: {:.1} µm³ of {:.1} µm³ is vessel, {} branches, {:.1} µm total length",
        track.name(),
        vessel_volume,
        roi_volume,
        metrics.branch_count,
        metrics.total_length
    );

    let measurements = RoiMeasurements {
        roi_name: track.name().to_string(),
        translated: track.is_translated(),
        roi_volume,
        vessel_volume,
        skeleton: metrics,
        branches,
        cells,
        nuclei_count,
    };
    (measurements, next_label)
}

/// Run every ROI of an already segmented image
pub fn analyse_image(image: &SegmentedImage, tracks: &[RoiTrack], config: &AnalysisConfig) -> ImageAnalysis {
    let vessel_mask = image.vessels.to_mask(image.shape);
    let skeleton = vessel_skeleton(&vessel_mask, &image.calibration, config);

    let mut results = ResultsAggregator::new(image.name.clone(), image.calibration.pixel_width_um);
    let mut next_label = 1;
    for track in tracks {
        let (measurements, next) = process_roi(image, &vessel_mask, &skeleton, track, config, next_label);
        next_label = next;
        results.add_roi(measurements);
    }

    ImageAnalysis {
        results,
        vessel_mask,
        skeleton,
    }
}

/// Append the image's rows to the result files under `output_dir`
pub fn write_results(results: &ResultsAggregator, output_dir: &Path, config: &AnalysisConfig) -> Result<()> {
    let columns = GlobalColumns {
        cells: config.microglia_channel.is_some(),
        nuclei: config.nuclei_channel.is_some(),
    };

    write_global_rows(output_dir, results.global_records(), columns)?;
    if columns.cells {
        write_cell_rows(output_dir, results.cell_records())?;
    }
    if config.write_branch_details {
        write_branch_rows(output_dir, results.branch_records())?;
    }
    Ok(())
}

/// QA composite of the vessel mask, every cell and nucleus, and the tagged skeleton
pub fn build_composite(image: &SegmentedImage, analysis: &ImageAnalysis) -> Result<CompositeVolume> {
    let mut composite = CompositeVolume::new(image.shape, image.calibration);
    composite.set_vessels(&analysis.vessel_mask)?;
    for population in [&image.cells, &image.nuclei].into_iter().flatten() {
        composite.add_cells(&population.to_mask(image.shape))?;
    }

    let tags: Array3<u8> = SkeletonGraph::build(&analysis.skeleton, image.calibration).tag_volume(image.shape);
    composite.set_skeleton_tags(&tags)?;
    Ok(composite)
}

/// Process one image directory end to end
pub fn process_image(entry: &ImageEntry, config: &AnalysisConfig) -> Result<ResultsAggregator> {
    info!("Processing image {}", entry.name);

    let image = load_image(entry, config)?;
    let (depth, height, width) = image.shape;
    let tracks = load_tracks(&entry.dir.join(&config.roi_file_name), width, height, depth)?;
    debug!("{} ROI(s) for {}", tracks.len(), entry.name);

    let analysis = analyse_image(&image, &tracks, config);

    let output_dir = Path::new(&config.output_base_dir);
    write_results(&analysis.results, output_dir, config)?;

    if config.save_composite {
        build_composite(&image, &analysis)?.save(output_dir.join(&image.name))?;
    }

    Ok(analysis.results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object3d::VolumetricObject;
    use crate::proximity::Category;
    use crate::roi::{RoiMask, RoiShape};
    use nalgebra::Vector2;

    const SHAPE: Idx3d = (12, 20, 60);

    // Straight vessel along x at (z, y) = (6, 10), radius 2 voxels
    fn tube() -> ObjectPopulation {
        let mut voxels = Vec::new();
        for z in 0..SHAPE.0 {
            for y in 0..SHAPE.1 {
                for x in 5..55 {
                    let (dz, dy) = (z as f64 - 6.0, y as f64 - 10.0);
                    if dz * dz + dy * dy <= 4.0 {
                        voxels.push((z, y, x));
                    }
                }
            }
        }
        let object = VolumetricObject::new(1, voxels).unwrap();
        ObjectPopulation::from_objects(vec![object], Calibration::new(1.0, 1.0))
    }

    fn cube(label: u32, (z, y, x): Idx3d, edge: usize) -> VolumetricObject {
        let mut voxels = Vec::new();
        for dz in 0..edge {
            for dy in 0..edge {
                for dx in 0..edge {
                    voxels.push((z + dz, y + dy, x + dx));
                }
            }
        }
        VolumetricObject::new(label, voxels).unwrap()
    }

    fn image(cells: Vec<VolumetricObject>) -> SegmentedImage {
        let calibration = Calibration::new(1.0, 1.0);
        SegmentedImage {
            name: "img".to_string(),
            calibration,
            shape: SHAPE,
            vessels: tube(),
            cells: Some(ObjectPopulation::from_objects(cells, calibration)),
            nuclei: None,
        }
    }

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            roi_dilation_um: 0.0,
            prune_skeleton: false,
            ..AnalysisConfig::default()
        }
    }

    fn rect_track(name: &str, x: f64, width: f64) -> RoiTrack {
        let shape = RoiShape::Rectangle {
            x,
            y: 0.0,
            width,
            height: SHAPE.1 as f64,
        };
        RoiTrack::new(name, shape.rasterize().unwrap(), Vector2::zeros(), SHAPE.0)
    }

    #[test]
    fn cells_are_classified_against_the_tube() {
        let cells = vec![
            // Straddles the vessel wall
            cube(1, (5, 7, 20), 3),
            // Well away from it
            cube(2, (0, 16, 30), 3),
        ];
        let image = image(cells);
        let whole = RoiTrack::whole_image(SHAPE.2, SHAPE.1, SHAPE.0);
        let analysis = analyse_image(&image, &[whole], &config());

        let records = analysis.results.cell_records();
        assert_eq!(records.len(), 2);
        assert_ne!(records[0].record.category, Category::Vdm);
        assert!(records[0].record.coloc_volume > 0.0);
        assert_eq!(records[1].record.category, Category::Vdm);
        assert!(records[1].record.border_distance > 0.0);

        let global = &analysis.results.global_records()[0];
        assert!(global.vessel_volume > 0.0);
        assert!(global.skeleton.total_length > 0.0);
        assert_eq!(global.cells.unwrap().count, 2);
    }

    #[test]
    fn cell_labels_run_on_across_rois() {
        let cells = vec![cube(1, (0, 0, 2), 2), cube(2, (0, 0, 40), 2), cube(3, (0, 0, 45), 2)];
        let image = image(cells);
        let tracks = [rect_track("left", 0.0, 20.0), rect_track("right", 30.0, 30.0)];
        let analysis = analyse_image(&image, &tracks, &config());

        let labels: Vec<(String, u32)> = analysis
            .results
            .cell_records()
            .iter()
            .map(|c| (c.roi_name.clone(), c.record.label))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("left".to_string(), 1),
                ("right".to_string(), 2),
                ("right".to_string(), 3)
            ]
        );
    }

    #[test]
    fn roi_without_vessel_reports_undefined_distances() {
        let image = image(vec![cube(1, (0, 0, 1), 2)]);
        let empty_corner = RoiTrack::new(
            "corner",
            RoiMask::full(4, 4),
            Vector2::zeros(),
            SHAPE.0,
        );
        let analysis = analyse_image(&image, &[empty_corner], &config());

        let global = &analysis.results.global_records()[0];
        assert_eq!(global.vessel_volume, 0.0);
        assert_eq!(global.skeleton.branch_count, 0);
        let record = &analysis.results.cell_records()[0].record;
        assert_eq!(record.category, Category::NoVessel);
        assert!(record.centroid_distance.is_nan());
        assert_eq!(global.cells.unwrap().tally.vdm, 1);
    }

    #[test]
    fn composite_carries_skeleton_and_cells() {
        let image = image(vec![cube(1, (0, 0, 1), 2)]);
        let whole = RoiTrack::whole_image(SHAPE.2, SHAPE.1, SHAPE.0);
        let analysis = analyse_image(&image, &[whole], &config());
        let composite = build_composite(&image, &analysis).unwrap();

        let slice = composite.slice_image(0);
        assert_eq!(slice.get_pixel(1, 0)[1], 255);
        let skeleton_pixels = (0..SHAPE.0)
            .map(|z| composite.slice_image(z).pixels().filter(|p| p[2] > 0).count())
            .sum::<usize>();
        assert!(skeleton_pixels > 0);
        assert!(skeleton_pixels <= count_foreground(&analysis.skeleton));
    }
}
