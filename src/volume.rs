// src/volume.rs - Voxel calibration and 3D index helpers shared by every stage

use nalgebra::Point3;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::errors::{Result, VesselAnalysisError};

/// Voxel index in `(z, y, x)` order, matching `Array3` indexing.
pub type Idx3d = (usize, usize, usize);

/// Signed neighbour offset in `(dz, dy, dx)` order.
pub type Offset3d = (isize, isize, isize);

/// Binary volume, `true` is foreground.
pub type BinaryVolume = Array3<bool>;

/// Physical voxel size. Pixels are square in the XY plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub pixel_width_um: f64,
    pub pixel_depth_um: f64,
}

impl Calibration {
    pub fn new(pixel_width_um: f64, pixel_depth_um: f64) -> Self {
        Self { pixel_width_um, pixel_depth_um }
    }

    #[inline]
    pub fn pixel_height_um(&self) -> f64 {
        self.pixel_width_um
    }

    /// Physical volume of one voxel in µm³
    #[inline]
    pub fn voxel_volume(&self) -> f64 {
        self.pixel_width_um * self.pixel_height_um() * self.pixel_depth_um
    }

    /// Axis spacing in `(z, y, x)` order
    #[inline]
    pub fn spacing(&self) -> [f64; 3] {
        [self.pixel_depth_um, self.pixel_height_um(), self.pixel_width_um]
    }

    /// Squared calibrated distance between two voxel centres
    #[inline]
    pub fn distance_squared(&self, a: Idx3d, b: Idx3d) -> f64 {
        let dz = a.0.abs_diff(b.0) as f64 * self.pixel_depth_um;
        let dy = a.1.abs_diff(b.1) as f64 * self.pixel_height_um();
        let dx = a.2.abs_diff(b.2) as f64 * self.pixel_width_um;
        dz * dz + dy * dy + dx * dx
    }

    /// Calibrated distance between two voxel centres
    #[inline]
    pub fn distance(&self, a: Idx3d, b: Idx3d) -> f64 {
        self.distance_squared(a, b).sqrt()
    }

    /// Physical position of a voxel centre as `(x, y, z)` in µm
    pub fn to_physical(&self, (z, y, x): Idx3d) -> Point3<f64> {
        Point3::new(
            x as f64 * self.pixel_width_um,
            y as f64 * self.pixel_height_um(),
            z as f64 * self.pixel_depth_um,
        )
    }

    /// Load a calibration sidecar (`calibration.json`)
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let calibration: Calibration = serde_json::from_str(&content)?;
        calibration.validate()?;
        Ok(calibration)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.pixel_width_um.is_finite() && self.pixel_width_um > 0.0) {
            return Err(VesselAnalysisError::Config(
                "pixel_width_um must be a positive number".to_string(),
            ));
        }
        if !(self.pixel_depth_um.is_finite() && self.pixel_depth_um > 0.0) {
            return Err(VesselAnalysisError::Config(
                "pixel_depth_um must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

/// The 26 neighbour offsets, enumerated z-major
pub const OFFSETS_26: [Offset3d; 26] = build_offsets_26();

/// The 6 face neighbour offsets
pub const OFFSETS_6: [Offset3d; 6] = [
    (-1, 0, 0),
    (1, 0, 0),
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, -1),
    (0, 0, 1),
];

const fn build_offsets_26() -> [Offset3d; 26] {
    let mut out = [(0, 0, 0); 26];
    let mut n = 0;
    let mut dz = -1;
    while dz <= 1 {
        let mut dy = -1;
        while dy <= 1 {
            let mut dx = -1;
            while dx <= 1 {
                if !(dz == 0 && dy == 0 && dx == 0) {
                    out[n] = (dz, dy, dx);
                    n += 1;
                }
                dx += 1;
            }
            dy += 1;
        }
        dz += 1;
    }
    out
}

/// Apply an offset to an index, `None` when the result leaves the volume
#[inline]
pub fn offset_index(idx: Idx3d, (dz, dy, dx): Offset3d, shape: Idx3d) -> Option<Idx3d> {
    let z = idx.0.checked_add_signed(dz)?;
    let y = idx.1.checked_add_signed(dy)?;
    let x = idx.2.checked_add_signed(dx)?;
    (z < shape.0 && y < shape.1 && x < shape.2).then_some((z, y, x))
}

/// In-bounds 26-neighbours of `idx`
pub fn neighbours_26(idx: Idx3d, shape: Idx3d) -> impl Iterator<Item = Idx3d> {
    OFFSETS_26
        .iter()
        .filter_map(move |&d| offset_index(idx, d, shape))
}

/// True when two distinct voxels touch under 26-connectivity
#[inline]
pub fn are_26_adjacent(a: Idx3d, b: Idx3d) -> bool {
    a != b && a.0.abs_diff(b.0) <= 1 && a.1.abs_diff(b.1) <= 1 && a.2.abs_diff(b.2) <= 1
}

/// Number of foreground voxels in a mask
pub fn count_foreground(mask: &BinaryVolume) -> usize {
    mask.iter().filter(|&&v| v).count()
}

/// Foreground voxel indices in raster (z, y, x) order
pub fn foreground_voxels(mask: &BinaryVolume) -> Vec<Idx3d> {
    mask.indexed_iter()
        .filter(|(_, &v)| v)
        .map(|(idx, _)| idx)
        .collect()
}

/// Ensure two volumes share a shape
pub fn check_same_shape(a: Idx3d, b: Idx3d, what: &str) -> Result<()> {
    if a != b {
        return Err(VesselAnalysisError::Volume(format!(
            "{} has shape {:?}, expected {:?}",
            what, b, a
        )));
    }
    Ok(())
}
