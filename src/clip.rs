// src/clip.rs - Per-slice clipping of volumes and populations to a drifting ROI

use log::debug;
use ndarray::{Array3, Axis};
use rayon::prelude::*;

use crate::object3d::ObjectPopulation;
use crate::roi::RoiTrack;
use crate::volume::{Calibration, Idx3d};

/// Applies one (optionally dilated) ROI track to volumes and populations.
///
/// Each slice is cleared outside the ROI displaced to that slice, so the
/// clipped silhouette follows the drift through the stack.
#[derive(Debug, Clone)]
pub struct VolumeClipper {
    track: RoiTrack,
}

impl VolumeClipper {
    /// Clipper for `track`, its ROI dilated by `dilate_by_um` when positive
    pub fn new(track: &RoiTrack, dilate_by_um: f64, calibration: &Calibration) -> Self {
        let track = if dilate_by_um > 0.0 {
            track.dilated(dilate_by_um, calibration)
        } else {
            track.clone()
        };
        Self { track }
    }

    pub fn track(&self) -> &RoiTrack {
        &self.track
    }

    /// Copy of `volume` with every voxel outside the displaced ROI reset to
    /// the default value
    pub fn clip<T>(&self, volume: &Array3<T>) -> Array3<T>
    where
        T: Clone + Default + Send + Sync,
    {
        let mut clipped = volume.clone();
        self.clip_in_place(&mut clipped);
        clipped
    }

    pub fn clip_in_place<T>(&self, volume: &mut Array3<T>)
    where
        T: Clone + Default + Send + Sync,
    {
        let track = &self.track;
        volume
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(z, mut slice)| {
                for ((y, x), value) in slice.indexed_iter_mut() {
                    if !track.contains(x as i64, y as i64, z) {
                        *value = T::default();
                    }
                }
            });
    }

    /// Population rebuilt from its clipped label volume; labels are kept
    pub fn clip_population(&self, population: &ObjectPopulation, shape: Idx3d) -> ObjectPopulation {
        let labels = self.clip(&population.to_label_volume(shape));
        let clipped = ObjectPopulation::from_label_values(&labels, *population.calibration());
        debug!(
            "Clipping to ROI {} kept {}/{} objects",
            self.track.name(),
            clipped.len(),
            population.len()
        );
        clipped
    }

    /// True when the (dilated) ROI covers every pixel of a `width × height` slice
    pub fn covers_image(&self, width: usize, height: usize) -> bool {
        self.track.mask().area_within(width, height) == width * height
    }
}

/// Objects whose rounded centroid lies inside the ROI displaced to the
/// centroid's slice. Labels are kept.
pub fn filter_objects_by_centroid(population: &ObjectPopulation, track: &RoiTrack) -> ObjectPopulation {
    let mut kept = ObjectPopulation::new(*population.calibration());
    for object in population.iter() {
        let (z, y, x) = object.centroid_voxel();
        if track.contains(x as i64, y as i64, z) {
            kept.push(object.clone());
        }
    }
    kept
}
