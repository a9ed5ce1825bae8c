// src/distance.rs - Anisotropic exact Euclidean distance transform

use ndarray::{Array3, Axis, Zip};

use crate::volume::{BinaryVolume, Calibration, Idx3d};

/// Calibrated distance field over a binary volume.
///
/// A normal field holds, at each foreground voxel, the distance to the nearest
/// background voxel and 0 on background. An inverse field holds, at each
/// background voxel, the distance to the nearest foreground voxel and 0 on
/// foreground. Voxels with no seed anywhere in the volume hold `f32::MAX`.
#[derive(Debug, Clone)]
pub struct DistanceField {
    values: Array3<f32>,
    inverse: bool,
}

impl DistanceField {
    pub fn values(&self) -> &Array3<f32> {
        &self.values
    }

    pub fn is_inverse(&self) -> bool {
        self.inverse
    }

    pub fn shape(&self) -> Idx3d {
        self.values.dim()
    }

    /// Field value at `idx`, `None` outside the volume
    pub fn get(&self, idx: Idx3d) -> Option<f32> {
        self.values.get(idx).copied()
    }

    pub fn into_values(self) -> Array3<f32> {
        self.values
    }
}

/// Anything able to produce a [`DistanceField`] from a mask
pub trait DistanceTransformer {
    fn transform(&self, mask: &BinaryVolume, calibration: &Calibration, inverse: bool) -> DistanceField;

    fn normal(&self, mask: &BinaryVolume, calibration: &Calibration) -> DistanceField {
        self.transform(mask, calibration, false)
    }

    fn inverse(&self, mask: &BinaryVolume, calibration: &Calibration) -> DistanceField {
        self.transform(mask, calibration, true)
    }
}

/// Separable squared-distance transform (lower envelope of parabolas),
/// one pass per axis, lanes processed in parallel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactEdt;

impl DistanceTransformer for ExactEdt {
    fn transform(&self, mask: &BinaryVolume, calibration: &Calibration, inverse: bool) -> DistanceField {
        // Seeds are the voxels the distance is measured to
        let mut squared = mask.mapv(|fg| if fg == inverse { 0.0f64 } else { f64::INFINITY });

        for (axis, spacing) in calibration.spacing().into_iter().enumerate() {
            Zip::from(squared.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
                let input: Vec<f64> = lane.iter().copied().collect();
                let mut output = vec![f64::INFINITY; input.len()];
                squared_distance_1d(&input, spacing, &mut output);
                for (dst, src) in lane.iter_mut().zip(output) {
                    *dst = src;
                }
            });
        }

        let values = squared.mapv(|d| {
            if d.is_finite() {
                d.sqrt() as f32
            } else {
                f32::MAX
            }
        });
        DistanceField { values, inverse }
    }
}

/// Normal field with the default engine
pub fn normal_field(mask: &BinaryVolume, calibration: &Calibration) -> DistanceField {
    ExactEdt.normal(mask, calibration)
}

/// Inverse field with the default engine
pub fn inverse_field(mask: &BinaryVolume, calibration: &Calibration) -> DistanceField {
    ExactEdt.inverse(mask, calibration)
}

/// 1D squared distance transform of sampled function `f` with sample spacing
/// `spacing`. Infinite samples never contribute a parabola; a lane without any
/// finite sample stays infinite.
fn squared_distance_1d(f: &[f64], spacing: f64, out: &mut [f64]) {
    let n = f.len();
    let mut vertices: Vec<usize> = Vec::with_capacity(n);
    let mut bounds: Vec<f64> = Vec::with_capacity(n);

    let intersect = |p: usize, q: usize| -> f64 {
        let xp = p as f64 * spacing;
        let xq = q as f64 * spacing;
        ((f[q] + xq * xq) - (f[p] + xp * xp)) / (2.0 * (xq - xp))
    };

    for q in 0..n {
        if !f[q].is_finite() {
            continue;
        }
        loop {
            match (vertices.last(), bounds.last()) {
                (Some(&p), Some(&left)) => {
                    let s = intersect(p, q);
                    if s <= left {
                        vertices.pop();
                        bounds.pop();
                        continue;
                    }
                    vertices.push(q);
                    bounds.push(s);
                }
                _ => {
                    vertices.push(q);
                    bounds.push(f64::NEG_INFINITY);
                }
            }
            break;
        }
    }

    if vertices.is_empty() {
        out.iter_mut().for_each(|v| *v = f64::INFINITY);
        return;
    }

    let mut k = 0;
    for (q, slot) in out.iter_mut().enumerate() {
        let x = q as f64 * spacing;
        while k + 1 < vertices.len() && bounds[k + 1] < x {
            k += 1;
        }
        let dx = x - vertices[k] as f64 * spacing;
        *slot = dx * dx + f[vertices[k]];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn brute_force(mask: &BinaryVolume, cal: &Calibration, inverse: bool) -> Array3<f64> {
        let seeds: Vec<Idx3d> = mask
            .indexed_iter()
            .filter(|(_, &fg)| fg == inverse)
            .map(|(i, _)| i)
            .collect();
        Array3::from_shape_fn(mask.dim(), |idx| {
            seeds
                .iter()
                .map(|&s| cal.distance(idx, s))
                .fold(f64::INFINITY, f64::min)
        })
    }

    fn blob() -> BinaryVolume {
        let mut mask = BinaryVolume::from_elem((5, 9, 11), false);
        for z in 1..4 {
            for y in 2..7 {
                for x in 1..9 {
                    mask[(z, y, x)] = true;
                }
            }
        }
        mask[(2, 4, 4)] = false;
        mask
    }

    #[test]
    fn matches_brute_force_on_anisotropic_grid() {
        let mask = blob();
        let cal = Calibration::new(0.4, 1.3);
        for inverse in [false, true] {
            let field = ExactEdt.transform(&mask, &cal, inverse);
            let expected = brute_force(&mask, &cal, inverse);
            for (idx, &v) in field.values().indexed_iter() {
                assert_approx_eq!(v as f64, expected[idx], 1e-4);
            }
        }
    }

    #[test]
    fn normal_and_inverse_fields_are_complementary() {
        let mask = blob();
        let cal = Calibration::new(1.0, 2.0);
        let normal = normal_field(&mask, &cal);
        let inverse = inverse_field(&mask, &cal);
        for (idx, &fg) in mask.indexed_iter() {
            let n = normal.values()[idx];
            let i = inverse.values()[idx];
            assert!(!(n > 0.0 && i > 0.0));
            if fg {
                assert_eq!(i, 0.0);
            } else {
                assert_eq!(n, 0.0);
            }
        }
    }

    #[test]
    fn missing_seeds_give_max_distance() {
        let cal = Calibration::new(1.0, 1.0);
        let empty = BinaryVolume::from_elem((2, 3, 3), false);
        let inverse = inverse_field(&empty, &cal);
        assert!(inverse.values().iter().all(|&v| v == f32::MAX));
        let normal = normal_field(&empty, &cal);
        assert!(normal.values().iter().all(|&v| v == 0.0));

        let full = BinaryVolume::from_elem((2, 3, 3), true);
        assert!(normal_field(&full, &cal).values().iter().all(|&v| v == f32::MAX));
    }

    #[test]
    fn single_slice_volume_is_planar() {
        let mut mask = BinaryVolume::from_elem((1, 1, 7), true);
        mask[(0, 0, 0)] = false;
        let field = normal_field(&mask, &Calibration::new(0.5, 3.0));
        assert_approx_eq!(field.values()[(0, 0, 6)], 3.0f32);
    }
}
