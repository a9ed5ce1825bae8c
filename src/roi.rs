// src/roi.rs - ROI shapes, rasterised masks and drift-compensated ROI tracks

use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_ellipse_mut, draw_filled_rect_mut, draw_polygon_mut};
use imageproc::point::Point;
use imageproc::rect::Rect;
use log::{debug, warn};
use nalgebra::{Point2, Vector2};
use ndarray::{s, Array2, Array3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::distance::inverse_field;
use crate::errors::{Result, VesselAnalysisError};
use crate::volume::Calibration;

/// Name given to the ROI covering the full image when no ROI file exists
pub const WHOLE_IMAGE_ROI: &str = "whole image";

/// Suffix marking the last-slice copy of an ROI
pub const PARTNER_SUFFIX: &str = "_2";

/// 2D ROI geometry in pixel coordinates of the reference (first) slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoiShape {
    Rectangle { x: f64, y: f64, width: f64, height: f64 },
    Oval { x: f64, y: f64, width: f64, height: f64 },
    Polygon { points: Vec<[f64; 2]> },
}

impl RoiShape {
    pub fn validate(&self) -> Result<()> {
        match self {
            RoiShape::Rectangle { x, y, width, height } | RoiShape::Oval { x, y, width, height } => {
                if ![x, y, width, height].iter().all(|v| v.is_finite()) {
                    return Err(VesselAnalysisError::Roi("non-finite ROI bounds".to_string()));
                }
                if *width < 1.0 || *height < 1.0 {
                    return Err(VesselAnalysisError::Roi(format!(
                        "ROI size {}x{} is smaller than one pixel",
                        width, height
                    )));
                }
            }
            RoiShape::Polygon { points } => {
                if points.len() < 3 {
                    return Err(VesselAnalysisError::Roi(format!(
                        "polygon needs at least 3 points, got {}",
                        points.len()
                    )));
                }
                if !points.iter().flatten().all(|v| v.is_finite()) {
                    return Err(VesselAnalysisError::Roi("non-finite polygon vertex".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Centre of mass of the ROI outline area, in pixels
    pub fn contour_centroid(&self) -> Point2<f64> {
        match self {
            RoiShape::Rectangle { x, y, width, height } | RoiShape::Oval { x, y, width, height } => {
                Point2::new(x + width / 2.0, y + height / 2.0)
            }
            RoiShape::Polygon { points } => polygon_centroid(points),
        }
    }

    /// `(min_x, min_y, max_x, max_y)` in pixels
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        match self {
            RoiShape::Rectangle { x, y, width, height } | RoiShape::Oval { x, y, width, height } => {
                (*x, *y, x + width, y + height)
            }
            RoiShape::Polygon { points } => points.iter().fold(
                (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
                |(x0, y0, x1, y1), p| (x0.min(p[0]), y0.min(p[1]), x1.max(p[0]), y1.max(p[1])),
            ),
        }
    }

    /// Fill the shape onto a local canvas
    pub fn rasterize(&self) -> Result<RoiMask> {
        self.validate()?;
        let fill = Luma([255u8]);

        let (canvas, ox, oy) = match self {
            RoiShape::Rectangle { x, y, width, height } => {
                let (w, h) = (width.round().max(1.0) as u32, height.round().max(1.0) as u32);
                let mut canvas = GrayImage::new(w, h);
                draw_filled_rect_mut(&mut canvas, Rect::at(0, 0).of_size(w, h), fill);
                (canvas, x.round() as i64, y.round() as i64)
            }
            RoiShape::Oval { x, y, width, height } => {
                let (w, h) = (width.round().max(1.0) as u32, height.round().max(1.0) as u32);
                let mut canvas = GrayImage::new(w, h);
                let rx = ((w as f64 - 1.0) / 2.0).round() as i32;
                let ry = ((h as f64 - 1.0) / 2.0).round() as i32;
                draw_filled_ellipse_mut(&mut canvas, (rx, ry), rx, ry, fill);
                (canvas, x.round() as i64, y.round() as i64)
            }
            RoiShape::Polygon { points } => {
                let (min_x, min_y, max_x, max_y) = self.bounds();
                let (ox, oy) = (min_x.floor(), min_y.floor());
                let w = (max_x.ceil() - ox) as u32 + 1;
                let h = (max_y.ceil() - oy) as u32 + 1;

                let mut vertices: Vec<Point<i32>> = points
                    .iter()
                    .map(|p| Point::new((p[0] - ox).round() as i32, (p[1] - oy).round() as i32))
                    .collect();
                vertices.dedup();
                // draw_polygon_mut rejects an explicitly closed outline
                while vertices.len() > 1 && vertices.first() == vertices.last() {
                    vertices.pop();
                }

                let mut canvas = GrayImage::new(w, h);
                if !vertices.is_empty() {
                    draw_polygon_mut(&mut canvas, &vertices, fill);
                }
                (canvas, ox as i64, oy as i64)
            }
        };

        Ok(RoiMask::from_gray(&canvas, ox, oy))
    }
}

fn polygon_centroid(points: &[[f64; 2]]) -> Point2<f64> {
    let n = points.len();
    let mut area2 = 0.0;
    let (mut cx, mut cy) = (0.0, 0.0);
    for i in 0..n {
        let [x0, y0] = points[i];
        let [x1, y1] = points[(i + 1) % n];
        let cross = x0 * y1 - x1 * y0;
        area2 += cross;
        cx += (x0 + x1) * cross;
        cy += (y0 + y1) * cross;
    }

    if area2.abs() < f64::EPSILON {
        // Degenerate outline: mean of the vertices
        let (sx, sy) = points.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
        let n = n.max(1) as f64;
        return Point2::new(sx / n, sy / n);
    }
    Point2::new(cx / (3.0 * area2), cy / (3.0 * area2))
}

/// Rasterised ROI: a boolean canvas placed at `origin` in image pixels
#[derive(Debug, Clone, PartialEq)]
pub struct RoiMask {
    pixels: Array2<bool>,
    origin: (i64, i64),
}

impl RoiMask {
    fn from_gray(canvas: &GrayImage, ox: i64, oy: i64) -> Self {
        let (w, h) = canvas.dimensions();
        let pixels = Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
            canvas.get_pixel(x as u32, y as u32)[0] > 0
        });
        Self { pixels, origin: (ox, oy) }
    }

    /// Mask covering `width × height` pixels from the image origin
    pub fn full(width: usize, height: usize) -> Self {
        Self {
            pixels: Array2::from_elem((height, width), true),
            origin: (0, 0),
        }
    }

    /// `(x, y)` of the canvas top-left corner
    pub fn origin(&self) -> (i64, i64) {
        self.origin
    }

    pub fn pixels(&self) -> &Array2<bool> {
        &self.pixels
    }

    /// Membership of image pixel `(x, y)`
    #[inline]
    pub fn contains(&self, x: i64, y: i64) -> bool {
        let (lx, ly) = (x - self.origin.0, y - self.origin.1);
        if lx < 0 || ly < 0 {
            return false;
        }
        self.pixels
            .get((ly as usize, lx as usize))
            .copied()
            .unwrap_or(false)
    }

    /// Total number of ROI pixels
    pub fn area(&self) -> usize {
        self.pixels.iter().filter(|&&p| p).count()
    }

    /// Number of ROI pixels falling inside a `width × height` image
    pub fn area_within(&self, width: usize, height: usize) -> usize {
        self.pixels
            .indexed_iter()
            .filter(|&((ly, lx), &p)| {
                let x = lx as i64 + self.origin.0;
                let y = ly as i64 + self.origin.1;
                p && x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height
            })
            .count()
    }

    /// Isotropic dilation by `radius_px` pixels (Euclidean)
    pub fn dilate(&self, radius_px: f64) -> Self {
        if radius_px <= 0.0 {
            return self.clone();
        }
        let pad = radius_px.ceil() as usize + 1;
        let (h, w) = self.pixels.dim();

        let mut padded = Array3::from_elem((1, h + 2 * pad, w + 2 * pad), false);
        padded
            .slice_mut(s![0, pad..pad + h, pad..pad + w])
            .assign(&self.pixels);

        let field = inverse_field(&padded, &Calibration::new(1.0, 1.0));
        let limit = radius_px as f32;
        let pixels = field
            .values()
            .slice(s![0, .., ..])
            .mapv(|d| d <= limit);

        Self {
            pixels,
            origin: (self.origin.0 - pad as i64, self.origin.1 - pad as i64),
        }
    }
}

/// An ROI followed through the stack with a linear per-slice drift
#[derive(Debug, Clone)]
pub struct RoiTrack {
    name: String,
    mask: RoiMask,
    translation: Vector2<f64>,
    num_slices: usize,
}

impl RoiTrack {
    pub fn new(name: impl Into<String>, mask: RoiMask, translation: Vector2<f64>, num_slices: usize) -> Self {
        Self {
            name: name.into(),
            mask,
            translation,
            num_slices,
        }
    }

    /// Track covering the full image extent with no drift
    pub fn whole_image(width: usize, height: usize, num_slices: usize) -> Self {
        Self::new(WHOLE_IMAGE_ROI, RoiMask::full(width, height), Vector2::zeros(), num_slices)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mask(&self) -> &RoiMask {
        &self.mask
    }

    /// Total displacement from the first to the last slice, in pixels
    pub fn translation(&self) -> Vector2<f64> {
        self.translation
    }

    pub fn is_translated(&self) -> bool {
        self.translation != Vector2::zeros()
    }

    pub fn num_slices(&self) -> usize {
        self.num_slices
    }

    /// Displacement between consecutive slices
    pub fn step(&self) -> Vector2<f64> {
        if self.num_slices <= 1 {
            Vector2::zeros()
        } else {
            self.translation / (self.num_slices - 1) as f64
        }
    }

    /// Displacement of the ROI at 0-based slice `z`
    pub fn offset_at(&self, z: usize) -> Vector2<f64> {
        self.step() * z as f64
    }

    /// Displacement at slice `z` rounded to whole pixels
    pub fn pixel_offset_at(&self, z: usize) -> (i64, i64) {
        let offset = self.offset_at(z);
        (offset.x.round() as i64, offset.y.round() as i64)
    }

    /// Whether image pixel `(x, y)` on slice `z` lies in the displaced ROI
    #[inline]
    pub fn contains(&self, x: i64, y: i64, z: usize) -> bool {
        let (dx, dy) = self.pixel_offset_at(z);
        self.mask.contains(x - dx, y - dy)
    }

    /// Same track with its ROI dilated by `dilation_um`
    pub fn dilated(&self, dilation_um: f64, calibration: &Calibration) -> Self {
        let radius_px = dilation_um / calibration.pixel_width_um;
        debug!("Dilating ROI {} by {:.2} px", self.name, radius_px);
        Self {
            name: self.name.clone(),
            mask: self.mask.dilate(radius_px),
            translation: self.translation,
            num_slices: self.num_slices,
        }
    }

    /// ROI area inside the image × slice depth × slice count, in µm³
    pub fn volume(&self, width: usize, height: usize, calibration: &Calibration) -> f64 {
        let area_um2 = self.mask.area_within(width, height) as f64
            * calibration.pixel_width_um
            * calibration.pixel_height_um();
        area_um2 * calibration.pixel_depth_um * self.num_slices as f64
    }
}

/// One named entry of an ROI file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiEntry {
    pub name: String,
    #[serde(flatten)]
    pub shape: RoiShape,
}

/// Read a JSON array of ROI entries
pub fn load_roi_entries<P: AsRef<Path>>(path: P) -> Result<Vec<RoiEntry>> {
    let content = fs::read_to_string(path.as_ref())?;
    let entries: Vec<RoiEntry> = serde_json::from_str(&content)?;
    Ok(entries)
}

/// Pair ROIs with their `_2` partners and build one track per base ROI.
///
/// A ROI is consumed as a partner only when its name is `<base>_2` and
/// `<base>` exists; the translation is the partner's contour centroid minus
/// the base's. Bases without a partner get zero translation.
pub fn build_tracks(entries: &[RoiEntry], num_slices: usize) -> Result<Vec<RoiTrack>> {
    let is_partner = |entry: &RoiEntry| {
        entry
            .name
            .strip_suffix(PARTNER_SUFFIX)
            .map(|base| entries.iter().any(|e| e.name == base))
            .unwrap_or(false)
    };

    let mut tracks = Vec::new();
    for entry in entries.iter().filter(|e| !is_partner(e)) {
        if tracks.iter().any(|t: &RoiTrack| t.name() == entry.name) {
            warn!("Duplicate ROI name {}, keeping the first one", entry.name);
            continue;
        }

        let partner_name = format!("{}{}", entry.name, PARTNER_SUFFIX);
        let translation = match entries.iter().find(|e| e.name == partner_name) {
            Some(partner) => {
                partner.shape.contour_centroid() - entry.shape.contour_centroid()
            }
            None => {
                warn!(
                    "ROI {} has no associated {} ROI, it won't be translated across the stack",
                    entry.name, partner_name
                );
                Vector2::zeros()
            }
        };
        debug!(
            "ROI {}: translation ({:.2}, {:.2}) px",
            entry.name, translation.x, translation.y
        );

        let mask = entry.shape.rasterize()?;
        tracks.push(RoiTrack::new(entry.name.clone(), mask, translation, num_slices));
    }
    Ok(tracks)
}

/// Tracks for one image: from `roi_path` when it exists, else the whole image
pub fn load_tracks(
    roi_path: &Path,
    width: usize,
    height: usize,
    num_slices: usize,
) -> Result<Vec<RoiTrack>> {
    if !roi_path.exists() {
        warn!(
            "No ROI file found at {}, analysing the whole image",
            roi_path.display()
        );
        return Ok(vec![RoiTrack::whole_image(width, height, num_slices)]);
    }

    let entries = load_roi_entries(roi_path)?;
    let tracks = build_tracks(&entries, num_slices)?;
    if tracks.is_empty() {
        warn!(
            "ROI file {} holds no ROI, analysing the whole image",
            roi_path.display()
        );
        return Ok(vec![RoiTrack::whole_image(width, height, num_slices)]);
    }
    Ok(tracks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn rect(name: &str, x: f64, y: f64, w: f64, h: f64) -> RoiEntry {
        RoiEntry {
            name: name.to_string(),
            shape: RoiShape::Rectangle { x, y, width: w, height: h },
        }
    }

    #[test]
    fn entries_parse_from_tagged_json() {
        let json = r#"[
            {"name": "a", "type": "rectangle", "x": 1, "y": 2, "width": 3, "height": 4},
            {"name": "b", "type": "polygon", "points": [[0, 0], [4, 0], [0, 4]]},
            {"name": "c", "type": "oval", "x": 0, "y": 0, "width": 5, "height": 5}
        ]"#;
        let entries: Vec<RoiEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[1].shape, RoiShape::Polygon { .. }));
    }

    #[test]
    fn rectangle_mask_covers_exact_pixels() {
        let mask = RoiShape::Rectangle { x: 2.0, y: 3.0, width: 4.0, height: 2.0 }
            .rasterize()
            .unwrap();
        assert_eq!(mask.area(), 8);
        assert!(mask.contains(2, 3));
        assert!(mask.contains(5, 4));
        assert!(!mask.contains(6, 4));
        assert!(!mask.contains(2, 5));
    }

    #[test]
    fn closed_polygon_outline_is_accepted() {
        let shape = RoiShape::Polygon {
            points: vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]],
        };
        let mask = shape.rasterize().unwrap();
        assert!(mask.contains(5, 5));
        assert!(!mask.contains(15, 5));
        let c = shape.contour_centroid();
        assert_approx_eq!(c.x, 5.0);
        assert_approx_eq!(c.y, 5.0);
    }

    #[test]
    fn oval_contains_centre_but_not_corners() {
        let mask = RoiShape::Oval { x: 0.0, y: 0.0, width: 11.0, height: 11.0 }
            .rasterize()
            .unwrap();
        assert!(mask.contains(5, 5));
        assert!(!mask.contains(0, 0));
    }

    #[test]
    fn degenerate_shapes_are_rejected() {
        assert!(RoiShape::Polygon { points: vec![[0.0, 0.0], [1.0, 1.0]] }
            .rasterize()
            .is_err());
        assert!(RoiShape::Rectangle { x: 0.0, y: 0.0, width: 0.0, height: 3.0 }
            .rasterize()
            .is_err());
    }

    #[test]
    fn dilation_grows_by_radius() {
        let mask = RoiShape::Rectangle { x: 10.0, y: 10.0, width: 1.0, height: 1.0 }
            .rasterize()
            .unwrap();
        let dilated = mask.dilate(3.0);
        assert!(dilated.contains(13, 10));
        assert!(!dilated.contains(14, 10));
        assert!(dilated.contains(12, 12));
        assert!(!dilated.contains(13, 13));
        assert!(dilated.area() > mask.area());
    }

    #[test]
    fn partner_roi_sets_translation() {
        let entries = vec![rect("r", 0.0, 0.0, 4.0, 4.0), rect("r_2", 9.0, -3.0, 4.0, 4.0)];
        let tracks = build_tracks(&entries, 10).unwrap();
        assert_eq!(tracks.len(), 1);
        let track = &tracks[0];
        assert!(track.is_translated());
        assert_approx_eq!(track.offset_at(0).x, 0.0);
        assert_approx_eq!(track.offset_at(9).x, 9.0);
        assert_approx_eq!(track.offset_at(9).y, -3.0);
        assert_approx_eq!(track.offset_at(3).x, 3.0);
    }

    #[test]
    fn unpaired_roi_is_not_translated() {
        let entries = vec![rect("a_2", 0.0, 0.0, 2.0, 2.0), rect("b", 0.0, 0.0, 2.0, 2.0)];
        let tracks = build_tracks(&entries, 5).unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|t| !t.is_translated()));
    }

    #[test]
    fn single_slice_track_has_zero_step() {
        let track = RoiTrack::new("x", RoiMask::full(4, 4), Vector2::new(5.0, 5.0), 1);
        assert_eq!(track.step(), Vector2::zeros());
        assert_eq!(track.pixel_offset_at(0), (0, 0));
    }

    #[test]
    fn volume_counts_pixels_inside_image() {
        let cal = Calibration::new(0.5, 2.0);
        let track = RoiTrack::whole_image(10, 4, 3);
        assert_approx_eq!(track.volume(10, 4, &cal), 40.0 * 0.25 * 2.0 * 3.0);

        let mask = RoiShape::Rectangle { x: -2.0, y: 0.0, width: 4.0, height: 1.0 }
            .rasterize()
            .unwrap();
        let partial = RoiTrack::new("edge", mask, Vector2::zeros(), 1);
        assert_approx_eq!(partial.volume(10, 4, &Calibration::new(1.0, 1.0)), 2.0);
    }

    #[test]
    fn missing_roi_file_gives_whole_image() {
        let path = std::env::temp_dir().join("vessel_proximity_no_such_rois.json");
        let tracks = load_tracks(&path, 8, 6, 2).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].name(), WHOLE_IMAGE_ROI);
        assert_eq!(tracks[0].mask().area(), 48);
    }
}
