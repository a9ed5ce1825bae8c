// src/segmentation.rs - Turning channel volumes into size-filtered object populations

use log::debug;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, VesselAnalysisError};
use crate::object3d::ObjectPopulation;
use crate::volume::{BinaryVolume, Calibration};

/// How a channel volume is turned into objects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SegmentationStrategy {
    /// Volume is already instance-labelled; one object per label value
    Labels,
    /// Any non-zero voxel is foreground; 26-connected components
    Binary,
    /// Intensity strictly above `level` is foreground
    Threshold { level: f64 },
    /// Automatic global threshold (Otsu, 256 bins over the intensity range)
    Otsu,
}

/// Inclusive calibrated volume range, `max_um3 = None` is unbounded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeRange {
    pub min_um3: f64,
    pub max_um3: Option<f64>,
}

impl SizeRange {
    pub fn new(min_um3: f64, max_um3: Option<f64>) -> Self {
        Self { min_um3, max_um3 }
    }

    pub fn upper(&self) -> f64 {
        self.max_um3.unwrap_or(f64::INFINITY)
    }
}

impl SegmentationStrategy {
    pub fn validate(&self) -> Result<()> {
        if let SegmentationStrategy::Threshold { level } = self {
            if !level.is_finite() {
                return Err(VesselAnalysisError::Config(format!(
                    "threshold level must be finite, got {}",
                    level
                )));
            }
        }
        Ok(())
    }

    /// Segment `volume` and keep objects whose volume lies in `size`
    pub fn segment(&self, volume: &Array3<u16>, calibration: Calibration, size: SizeRange) -> ObjectPopulation {
        let mut population = match self {
            SegmentationStrategy::Labels => ObjectPopulation::from_label_values(volume, calibration),
            SegmentationStrategy::Binary => ObjectPopulation::from_labeled_volume(volume, calibration),
            SegmentationStrategy::Threshold { level } => {
                let mask = threshold_mask(volume, *level);
                ObjectPopulation::from_labeled_volume(&mask, calibration)
            }
            SegmentationStrategy::Otsu => {
                let mask = otsu_mask(volume);
                ObjectPopulation::from_labeled_volume(&mask, calibration)
            }
        };

        let found = population.len();
        population.filter_by_size(size.min_um3, size.upper());
        debug!(
            "{:?} segmentation: {} objects, {} within [{}, {}] µm³",
            self,
            found,
            population.len(),
            size.min_um3,
            size.upper()
        );
        population
    }
}

/// Voxels with intensity strictly above `level`
pub fn threshold_mask(volume: &Array3<u16>, level: f64) -> BinaryVolume {
    volume.mapv(|v| v as f64 > level)
}

/// Intensity range and the 256-bin histogram spanning it
fn histogram(volume: &Array3<u16>) -> Option<(u16, u16, [u64; 256])> {
    let min = volume.iter().copied().min()?;
    let max = volume.iter().copied().max()?;
    let mut bins = [0u64; 256];
    for &v in volume.iter() {
        bins[bin_of(v, min, max)] += 1;
    }
    Some((min, max, bins))
}

#[inline]
fn bin_of(value: u16, min: u16, max: u16) -> usize {
    if max == min {
        return 0;
    }
    (((value - min) as f64 / (max - min) as f64) * 255.0) as usize
}

/// Otsu bin: voxels in bins above it are foreground
fn otsu_bin(bins: &[u64; 256]) -> usize {
    let total: f64 = bins.iter().map(|&c| c as f64).sum();
    let sum: f64 = bins.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();

    let mut sum_b = 0.0;
    let mut weight_b = 0.0;
    let mut max_variance = 0.0;
    let mut threshold = 0;

    for (i, &count) in bins.iter().enumerate() {
        weight_b += count as f64;
        if weight_b == 0.0 {
            continue;
        }
        let weight_f = total - weight_b;
        if weight_f == 0.0 {
            break;
        }

        sum_b += i as f64 * count as f64;
        let mean_b = sum_b / weight_b;
        let mean_f = (sum - sum_b) / weight_f;
        let variance = weight_b * weight_f * (mean_b - mean_f).powi(2);
        if variance > max_variance {
            max_variance = variance;
            threshold = i;
        }
    }
    threshold
}

/// Lowest foreground intensity chosen by Otsu's method, `None` for a flat volume
pub fn otsu_level(volume: &Array3<u16>) -> Option<f64> {
    let (min, max, bins) = histogram(volume)?;
    if min == max {
        return None;
    }
    let t = otsu_bin(&bins);
    Some(min as f64 + (t + 1) as f64 * (max - min) as f64 / 255.0)
}

/// Foreground mask from Otsu's method; empty for a flat volume
pub fn otsu_mask(volume: &Array3<u16>) -> BinaryVolume {
    match histogram(volume) {
        Some((min, max, bins)) if min != max => {
            let t = otsu_bin(&bins);
            debug!("Otsu threshold bin {} over [{}, {}]", t, min, max);
            volume.mapv(|v| bin_of(v, min, max) > t)
        }
        _ => BinaryVolume::from_elem(volume.dim(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Array3<u16> {
        let mut volume = Array3::<u16>::from_elem((4, 10, 10), 10);
        for z in 0..4 {
            for y in 1..4 {
                for x in 1..4 {
                    volume[(z, y, x)] = 200;
                }
            }
            volume[(z, 8, 8)] = 180;
        }
        volume
    }

    #[test]
    fn strategies_deserialize_from_method_tag() {
        let s: SegmentationStrategy = toml::from_str("method = \"otsu\"").unwrap();
        assert_eq!(s, SegmentationStrategy::Otsu);
        let s: SegmentationStrategy = toml::from_str("method = \"threshold\"\nlevel = 12.5").unwrap();
        assert_eq!(s, SegmentationStrategy::Threshold { level: 12.5 });
    }

    #[test]
    fn otsu_separates_bimodal_intensities() {
        let volume = two_blobs();
        let mask = otsu_mask(&volume);
        assert!(mask[(0, 2, 2)]);
        assert!(mask[(3, 8, 8)]);
        assert!(!mask[(0, 6, 6)]);
        let level = otsu_level(&volume).unwrap();
        assert!(level > 10.0 && level <= 180.0);
    }

    #[test]
    fn flat_volume_has_no_otsu_foreground() {
        let volume = Array3::<u16>::from_elem((2, 2, 2), 7);
        assert!(otsu_mask(&volume).iter().all(|&v| !v));
        assert!(otsu_level(&volume).is_none());
    }

    #[test]
    fn threshold_then_size_filter() {
        let cal = Calibration::new(1.0, 1.0);
        let strategy = SegmentationStrategy::Threshold { level: 100.0 };
        let all = strategy.segment(&two_blobs(), cal, SizeRange::new(0.0, None));
        assert_eq!(all.len(), 2);
        let big = strategy.segment(&two_blobs(), cal, SizeRange::new(5.0, None));
        assert_eq!(big.len(), 1);
        assert_eq!(big.objects()[0].voxel_count(), 36);
        let none = strategy.segment(&two_blobs(), cal, SizeRange::new(0.0, Some(3.0)));
        assert!(none.is_empty());
    }

    #[test]
    fn labels_keep_touching_instances_apart() {
        let mut volume = Array3::<u16>::zeros((1, 1, 4));
        volume[(0, 0, 0)] = 1;
        volume[(0, 0, 1)] = 2;
        let cal = Calibration::new(1.0, 1.0);
        let range = SizeRange::new(0.0, None);
        assert_eq!(SegmentationStrategy::Labels.segment(&volume, cal, range).len(), 2);
        assert_eq!(SegmentationStrategy::Binary.segment(&volume, cal, range).len(), 1);
    }

    #[test]
    fn non_finite_level_is_rejected() {
        assert!(SegmentationStrategy::Threshold { level: f64::NAN }.validate().is_err());
        assert!(SegmentationStrategy::Otsu.validate().is_ok());
    }
}
