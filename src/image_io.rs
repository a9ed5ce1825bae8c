// src/image_io.rs - Slice-stack loading, image discovery and PNG saving

use image::{DynamicImage, ImageFormat, RgbImage};
use log::debug;
use ndarray::{Array2, Array3, Axis};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{Result, VesselAnalysisError};
use crate::volume::Calibration;

/// Sidecar holding the voxel calibration of an image directory
pub const CALIBRATION_FILE: &str = "calibration.json";

const SLICE_EXTENSIONS: [&str; 3] = ["png", "tif", "tiff"];

/// One image to analyse: a directory holding one sub-directory per channel
#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub name: String,
    pub dir: PathBuf,
}

/// Image directories directly under `input_dir`, sorted by name
pub fn discover_images<P: AsRef<Path>>(input_dir: P) -> Result<Vec<ImageEntry>> {
    let input_dir = input_dir.as_ref();

    if !input_dir.exists() {
        return Err(VesselAnalysisError::InvalidPath(input_dir.to_path_buf()));
    }
    if !input_dir.is_dir() {
        return Err(VesselAnalysisError::Config(format!(
            "{} is not a directory",
            input_dir.display()
        )));
    }

    let mut images = Vec::new();
    for entry in fs::read_dir(input_dir).map_err(|e| VesselAnalysisError::Io(e))? {
        let path = entry.map_err(|e| VesselAnalysisError::Io(e))?.path();
        if !path.is_dir() {
            continue;
        }
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| VesselAnalysisError::InvalidPath(path.clone()))?
            .to_string();
        images.push(ImageEntry { name, dir: path });
    }

    images.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(images)
}

/// Slice files of a channel directory in z order (file name order)
pub fn list_slices<P: AsRef<Path>>(channel_dir: P) -> Result<Vec<PathBuf>> {
    let channel_dir = channel_dir.as_ref();
    if !channel_dir.is_dir() {
        return Err(VesselAnalysisError::InvalidPath(channel_dir.to_path_buf()));
    }

    let mut slices: Vec<PathBuf> = fs::read_dir(channel_dir)
        .map_err(|e| VesselAnalysisError::Io(e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| SLICE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();

    slices.sort();
    Ok(slices)
}

/// Grey values of one slice; 8- and 16-bit values are kept as stored
fn slice_values(image: DynamicImage) -> (u32, u32, Vec<u16>) {
    match image {
        DynamicImage::ImageLuma8(img) => {
            let (w, h) = img.dimensions();
            (w, h, img.into_raw().into_iter().map(u16::from).collect())
        }
        DynamicImage::ImageLuma16(img) => {
            let (w, h) = img.dimensions();
            (w, h, img.into_raw())
        }
        other => {
            let img = other.to_luma16();
            let (w, h) = img.dimensions();
            (w, h, img.into_raw())
        }
    }
}

/// Load a channel directory as a `(z, y, x)` volume
pub fn load_stack<P: AsRef<Path>>(channel_dir: P) -> Result<Array3<u16>> {
    let channel_dir = channel_dir.as_ref();
    let slices = list_slices(channel_dir)?;
    if slices.is_empty() {
        return Err(VesselAnalysisError::Volume(format!(
            "no slices found in {}",
            channel_dir.display()
        )));
    }

    let mut volume: Option<Array3<u16>> = None;
    for (z, path) in slices.iter().enumerate() {
        let image = image::open(path).map_err(|e| VesselAnalysisError::Image(e))?;
        let (w, h, values) = slice_values(image);

        let stack = volume.get_or_insert_with(|| {
            Array3::zeros((slices.len(), h as usize, w as usize))
        });
        let (_, sh, sw) = stack.dim();
        if (sh, sw) != (h as usize, w as usize) {
            return Err(VesselAnalysisError::Volume(format!(
                "slice {} is {}x{}, expected {}x{}",
                path.display(),
                w,
                h,
                sw,
                sh
            )));
        }

        let plane = Array2::from_shape_vec((sh, sw), values)
            .map_err(|e| VesselAnalysisError::Volume(e.to_string()))?;
        stack.index_axis_mut(Axis(0), z).assign(&plane);
    }

    let volume = volume.ok_or_else(|| VesselAnalysisError::InvalidPath(channel_dir.to_path_buf()))?;
    debug!("Loaded {} with shape {:?}", channel_dir.display(), volume.dim());
    Ok(volume)
}

/// Calibration from the image's sidecar, or `default` when there is none
pub fn load_calibration<P: AsRef<Path>>(image_dir: P, default: Calibration) -> Result<Calibration> {
    let path = image_dir.as_ref().join(CALIBRATION_FILE);
    if path.exists() {
        Calibration::from_json_file(&path)
    } else {
        Ok(default)
    }
}

/// Save an RGB image as PNG
pub fn save_image<P: AsRef<Path>>(image: &RgbImage, path: P) -> Result<()> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| VesselAnalysisError::Image(e))?;
    Ok(())
}
