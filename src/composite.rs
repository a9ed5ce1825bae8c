// src/composite.rs - RGB quality-control composite of masks and skeleton tags

use image::{Rgb, RgbImage};
use log::info;
use ndarray::{Array3, Zip};
use std::fs;
use std::path::Path;

use crate::errors::{Result, VesselAnalysisError};
use crate::image_io::{save_image, CALIBRATION_FILE};
use crate::volume::{check_same_shape, BinaryVolume, Calibration, Idx3d};

/// Red: vessel mask, green: cells and nuclei, blue: skeleton tags
#[derive(Debug, Clone)]
pub struct CompositeVolume {
    vessels: BinaryVolume,
    cells: BinaryVolume,
    skeleton: Array3<u8>,
    calibration: Calibration,
}

impl CompositeVolume {
    pub fn new(shape: Idx3d, calibration: Calibration) -> Self {
        Self {
            vessels: BinaryVolume::from_elem(shape, false),
            cells: BinaryVolume::from_elem(shape, false),
            skeleton: Array3::zeros(shape),
            calibration,
        }
    }

    pub fn shape(&self) -> Idx3d {
        self.vessels.dim()
    }

    pub fn set_vessels(&mut self, mask: &BinaryVolume) -> Result<()> {
        check_same_shape(self.shape(), mask.dim(), "vessel mask")?;
        self.vessels.assign(mask);
        Ok(())
    }

    /// Add a population mask to the green channel
    pub fn add_cells(&mut self, mask: &BinaryVolume) -> Result<()> {
        check_same_shape(self.shape(), mask.dim(), "cell mask")?;
        Zip::from(&mut self.cells).and(mask).for_each(|c, &m| *c |= m);
        Ok(())
    }

    pub fn set_skeleton_tags(&mut self, tags: &Array3<u8>) -> Result<()> {
        check_same_shape(self.shape(), tags.dim(), "skeleton tags")?;
        self.skeleton.assign(tags);
        Ok(())
    }

    pub fn slice_image(&self, z: usize) -> RgbImage {
        let (_, h, w) = self.shape();
        RgbImage::from_fn(w as u32, h as u32, |x, y| {
            let idx = (z, y as usize, x as usize);
            Rgb([
                if self.vessels[idx] { 255 } else { 0 },
                if self.cells[idx] { 255 } else { 0 },
                self.skeleton[idx],
            ])
        })
    }

    /// Write one PNG per slice and the calibration sidecar into `dir`
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<usize> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| VesselAnalysisError::Io(e))?;

        let depth = self.shape().0;
        for z in 0..depth {
            save_image(&self.slice_image(z), dir.join(format!("composite_z{:04}.png", z)))?;
        }

        let sidecar = serde_json::to_string_pretty(&self.calibration)?;
        fs::write(dir.join(CALIBRATION_FILE), sidecar).map_err(|e| VesselAnalysisError::Io(e))?;

        info!("Saved {} composite slices to {}", depth, dir.display());
        Ok(depth)
    }
}
