// src/proximity.rs - Cell-to-vessel relationship measurements and classification

use log::{debug, warn};
use rayon::prelude::*;
use std::fmt;

use crate::distance::{DistanceField, DistanceTransformer};
use crate::object3d::{BoxedVoxelIndex, ObjectPopulation, VolumetricObject};
use crate::volume::{foreground_voxels, offset_index, BinaryVolume, Calibration, Idx3d, OFFSETS_6};

/// Spatial relationship of a cell to the vasculature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// No vessel in the ROI; counted with the distant cells
    NoVessel,
    /// No overlap with the vessel mask
    Vdm,
    /// Overlaps the vessel with its centroid inside it
    Vam,
    /// Overlaps the vessel with its centroid outside it
    Vtm,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::NoVessel => "VDM (no vessel)",
            Category::Vdm => "VDM",
            Category::Vam => "VAM",
            Category::Vtm => "VTM",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-cell measurements against the vessel network
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelationshipRecord {
    pub label: u32,
    pub volume: f64,
    pub coloc_volume: f64,
    pub centroid_distance: f64,
    pub border_distance: f64,
    pub nearest_vessel_diameter: f64,
    pub category: Category,
}

/// VAM / VTM / VDM counts for one ROI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryTally {
    pub vam: usize,
    pub vtm: usize,
    pub vdm: usize,
}

impl CategoryTally {
    pub fn add(&mut self, category: Category) {
        match category {
            Category::Vam => self.vam += 1,
            Category::Vtm => self.vtm += 1,
            Category::Vdm | Category::NoVessel => self.vdm += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.vam + self.vtm + self.vdm
    }

    pub fn from_records(records: &[RelationshipRecord]) -> Self {
        let mut tally = Self::default();
        for record in records {
            tally.add(record.category);
        }
        tally
    }
}

/// Vessel-side state shared by every cell of one ROI
pub struct ProximityClassifier {
    vessel_mask: BinaryVolume,
    vessel_present: bool,
    normal: DistanceField,
    inverse: DistanceField,
    surface_index: BoxedVoxelIndex,
    skeleton_index: BoxedVoxelIndex,
    calibration: Calibration,
}

impl ProximityClassifier {
    /// `vessel_mask` is the vessel mask clipped to the (dilated) ROI and
    /// `skeleton` the vessel skeleton clipped the same way. `vessel_volume_um3`
    /// is the vessel volume inside the non-dilated ROI; when it is zero every
    /// cell is reported without vessel measurements.
    pub fn new<D: DistanceTransformer>(
        vessel_mask: BinaryVolume,
        skeleton: &BinaryVolume,
        vessel_volume_um3: f64,
        calibration: Calibration,
        transformer: &D,
    ) -> Self {
        let normal = transformer.normal(&vessel_mask, &calibration);
        let inverse = transformer.inverse(&vessel_mask, &calibration);
        Self::with_fields(vessel_mask, skeleton, vessel_volume_um3, calibration, normal, inverse)
    }

    /// Same as [`ProximityClassifier::new`] with precomputed distance fields
    pub fn with_fields(
        vessel_mask: BinaryVolume,
        skeleton: &BinaryVolume,
        vessel_volume_um3: f64,
        calibration: Calibration,
        normal: DistanceField,
        inverse: DistanceField,
    ) -> Self {
        let vessel_present = vessel_volume_um3 > 0.0;
        if !vessel_present {
            warn!("No vessel in ROI, vessel-dependent cell measurements are undefined");
        }

        let surface_index = BoxedVoxelIndex::new(mask_surface(&vessel_mask), calibration);
        let skeleton_index = BoxedVoxelIndex::new(foreground_voxels(skeleton), calibration);
        debug!(
            "Proximity index: {} vessel surface voxels, {} skeleton voxels",
            surface_index.len(),
            skeleton_index.len()
        );

        Self {
            vessel_mask,
            vessel_present,
            normal,
            inverse,
            surface_index,
            skeleton_index,
            calibration,
        }
    }

    pub fn normal_field(&self) -> &DistanceField {
        &self.normal
    }

    pub fn inverse_field(&self) -> &DistanceField {
        &self.inverse
    }

    pub fn classify(&self, cell: &VolumetricObject) -> RelationshipRecord {
        let volume = cell.volume(&self.calibration);

        if !self.vessel_present {
            return RelationshipRecord {
                label: cell.label(),
                volume,
                coloc_volume: f64::NAN,
                centroid_distance: f64::NAN,
                border_distance: f64::NAN,
                nearest_vessel_diameter: f64::NAN,
                category: Category::NoVessel,
            };
        }

        let overlap = cell.overlap_count(&self.vessel_mask);
        let coloc_volume = overlap as f64 * self.calibration.voxel_volume();
        let centroid_distance = field_value(&self.inverse, cell.centroid_voxel());

        let border_distance = if overlap > 0 {
            0.0
        } else {
            self.surface_index
                .nearest(&cell.surface_voxels())
                .map(|pair| pair.distance)
                .unwrap_or(f64::NAN)
        };

        let nearest_vessel_diameter = self
            .skeleton_index
            .nearest(cell.voxels())
            .map(|pair| 2.0 * field_value(&self.normal, pair.target))
            .unwrap_or(f64::NAN);

        let category = if coloc_volume == 0.0 {
            Category::Vdm
        } else if centroid_distance == 0.0 {
            Category::Vam
        } else {
            Category::Vtm
        };

        RelationshipRecord {
            label: cell.label(),
            volume,
            coloc_volume,
            centroid_distance,
            border_distance,
            nearest_vessel_diameter,
            category,
        }
    }

    /// Records in population order plus the per-category tally
    pub fn classify_population(&self, cells: &ObjectPopulation) -> (Vec<RelationshipRecord>, CategoryTally) {
        let records: Vec<RelationshipRecord> = cells
            .objects()
            .par_iter()
            .map(|cell| self.classify(cell))
            .collect();
        let tally = CategoryTally::from_records(&records);
        (records, tally)
    }
}

fn field_value(field: &DistanceField, idx: Idx3d) -> f64 {
    match field.get(idx) {
        Some(v) if v < f32::MAX => v as f64,
        _ => f64::NAN,
    }
}

/// Foreground voxels with a background face neighbour inside the volume
fn mask_surface(mask: &BinaryVolume) -> Vec<Idx3d> {
    let shape = mask.dim();
    foreground_voxels(mask)
        .into_iter()
        .filter(|&v| {
            OFFSETS_6
                .iter()
                .filter_map(|&d| offset_index(v, d, shape))
                .any(|n| !mask[n])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::ExactEdt;
    use assert_approx_eq::assert_approx_eq;

    fn slab_vessel() -> BinaryVolume {
        // Vessel occupies x in 0..6 across the whole volume
        BinaryVolume::from_shape_fn((4, 8, 20), |(_, _, x)| x < 6)
    }

    fn skeleton_of_slab() -> BinaryVolume {
        BinaryVolume::from_shape_fn((4, 8, 20), |(z, y, x)| z == 2 && x == 3 && y > 0 && y < 7)
    }

    fn classifier(vessel_volume: f64) -> ProximityClassifier {
        ProximityClassifier::new(
            slab_vessel(),
            &skeleton_of_slab(),
            vessel_volume,
            Calibration::new(1.0, 1.0),
            &ExactEdt,
        )
    }

    fn cell(label: u32, voxels: Vec<Idx3d>) -> VolumetricObject {
        VolumetricObject::new(label, voxels).unwrap()
    }

    #[test]
    fn embedded_cell_is_vam() {
        let record = classifier(100.0).classify(&cell(1, vec![(1, 3, 2), (1, 3, 3), (1, 4, 2)]));
        assert_eq!(record.category, Category::Vam);
        assert_approx_eq!(record.coloc_volume, record.volume);
        assert_eq!(record.centroid_distance, 0.0);
        assert_eq!(record.border_distance, 0.0);
    }

    #[test]
    fn straddling_cell_is_vtm() {
        // Centroid at x = 6, one voxel outside the vessel
        let record = classifier(100.0).classify(&cell(2, vec![(1, 3, 5), (1, 3, 6), (1, 3, 7)]));
        assert_eq!(record.category, Category::Vtm);
        assert_approx_eq!(record.coloc_volume, 1.0);
        assert_approx_eq!(record.centroid_distance, 1.0);
    }

    #[test]
    fn separate_cell_is_vdm_with_exact_border_distance() {
        let record = classifier(100.0).classify(&cell(3, vec![(1, 3, 9), (1, 3, 10)]));
        assert_eq!(record.category, Category::Vdm);
        assert_eq!(record.coloc_volume, 0.0);
        assert_approx_eq!(record.border_distance, 4.0);
        assert_approx_eq!(record.centroid_distance, 5.0);
        assert!(record.centroid_distance > 0.0);
    }

    #[test]
    fn nearest_diameter_reads_normal_field_at_skeleton() {
        let record = classifier(100.0).classify(&cell(4, vec![(2, 3, 12)]));
        // Skeleton at x = 3 sits 3 voxels from the vessel boundary at x = 6
        assert_approx_eq!(record.nearest_vessel_diameter, 6.0);
    }

    #[test]
    fn missing_vessel_gives_nan_and_counts_as_distant() {
        let classifier = classifier(0.0);
        let cells = ObjectPopulation::from_objects(
            vec![cell(1, vec![(1, 3, 2)]), cell(2, vec![(1, 3, 12)])],
            Calibration::new(1.0, 1.0),
        );
        let (records, tally) = classifier.classify_population(&cells);
        assert!(records.iter().all(|r| r.category == Category::NoVessel));
        assert!(records[0].coloc_volume.is_nan());
        assert!(records[0].nearest_vessel_diameter.is_nan());
        assert_eq!(tally.vdm, 2);
        assert_eq!(tally.total(), cells.len());
    }

    #[test]
    fn tally_is_exhaustive() {
        let cells = ObjectPopulation::from_objects(
            vec![
                cell(1, vec![(1, 3, 2)]),
                cell(2, vec![(1, 3, 5), (1, 3, 6), (1, 3, 7)]),
                cell(3, vec![(1, 3, 15)]),
            ],
            Calibration::new(1.0, 1.0),
        );
        let (records, tally) = classifier(100.0).classify_population(&cells);
        assert_eq!(records.len(), 3);
        assert_eq!(tally, CategoryTally { vam: 1, vtm: 1, vdm: 1 });
    }
}
