// src/config.rs - Analysis configuration loaded from TOML

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::errors::{Result, VesselAnalysisError};
use crate::segmentation::{SegmentationStrategy, SizeRange};
use crate::volume::Calibration;

/// Immutable settings for a batch run
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub input_path: String,
    pub output_base_dir: String,

    // Default calibration, overridden per image by calibration.json
    #[serde(default = "default_pixel_width_um")]
    pub pixel_width_um: f64,
    #[serde(default = "default_pixel_depth_um")]
    pub pixel_depth_um: f64,

    // Channel sub-directories
    #[serde(default = "default_vessel_channel")]
    pub vessel_channel: String,
    #[serde(default = "default_microglia_channel")]
    pub microglia_channel: Option<String>,
    #[serde(default)]
    pub nuclei_channel: Option<String>,

    // Object volume bounds (µm³), no maximum when unset
    #[serde(default = "default_min_vessel_volume_um3")]
    pub min_vessel_volume_um3: f64,
    #[serde(default)]
    pub max_vessel_volume_um3: Option<f64>,
    #[serde(default = "default_min_cell_volume_um3")]
    pub min_microglia_volume_um3: f64,
    #[serde(default)]
    pub max_microglia_volume_um3: Option<f64>,
    #[serde(default = "default_min_cell_volume_um3")]
    pub min_nucleus_volume_um3: f64,
    #[serde(default)]
    pub max_nucleus_volume_um3: Option<f64>,

    #[serde(default = "default_true")]
    pub drop_single_plane_nuclei: bool,

    #[serde(default = "default_roi_dilation_um")]
    pub roi_dilation_um: f64,

    // Skeleton pruning
    #[serde(default = "default_true")]
    pub prune_skeleton: bool,
    #[serde(default = "default_min_branch_length_um")]
    pub min_branch_length_um: f64,

    #[serde(default = "default_roi_file_name")]
    pub roi_file_name: String,

    #[serde(default = "default_true")]
    pub write_branch_details: bool,
    #[serde(default = "default_true")]
    pub save_composite: bool,

    // TOML tables must follow plain values
    #[serde(default = "default_vessel_segmentation")]
    pub vessel_segmentation: SegmentationStrategy,
    #[serde(default = "default_cell_segmentation")]
    pub microglia_segmentation: SegmentationStrategy,
    #[serde(default = "default_cell_segmentation")]
    pub nuclei_segmentation: SegmentationStrategy,
}

fn default_pixel_width_um() -> f64 {
    1.0
}

fn default_pixel_depth_um() -> f64 {
    1.0
}

fn default_vessel_channel() -> String {
    "vessels".to_string()
}

fn default_microglia_channel() -> Option<String> {
    Some("microglia".to_string())
}

fn default_vessel_segmentation() -> SegmentationStrategy {
    SegmentationStrategy::Otsu
}

fn default_cell_segmentation() -> SegmentationStrategy {
    SegmentationStrategy::Labels
}

fn default_min_vessel_volume_um3() -> f64 {
    70.0
}

fn default_min_cell_volume_um3() -> f64 {
    20.0
}

fn default_roi_dilation_um() -> f64 {
    50.0
}

fn default_min_branch_length_um() -> f64 {
    10.0
}

fn default_roi_file_name() -> String {
    "rois.json".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            input_path: "./input".to_string(),
            output_base_dir: "./output".to_string(),
            pixel_width_um: default_pixel_width_um(),
            pixel_depth_um: default_pixel_depth_um(),
            vessel_channel: default_vessel_channel(),
            microglia_channel: default_microglia_channel(),
            nuclei_channel: None,
            vessel_segmentation: default_vessel_segmentation(),
            microglia_segmentation: default_cell_segmentation(),
            nuclei_segmentation: default_cell_segmentation(),
            min_vessel_volume_um3: default_min_vessel_volume_um3(),
            max_vessel_volume_um3: None,
            min_microglia_volume_um3: default_min_cell_volume_um3(),
            max_microglia_volume_um3: None,
            min_nucleus_volume_um3: default_min_cell_volume_um3(),
            max_nucleus_volume_um3: None,
            drop_single_plane_nuclei: true,
            roi_dilation_um: default_roi_dilation_um(),
            prune_skeleton: true,
            min_branch_length_um: default_min_branch_length_um(),
            roi_file_name: default_roi_file_name(),
            write_branch_details: true,
            save_composite: true,
        }
    }
}

impl AnalysisConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            VesselAnalysisError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        toml::from_str(&content).map_err(|source| VesselAnalysisError::ConfigLoad {
            source,
            path: path.to_path_buf(),
        })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            VesselAnalysisError::Config(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path, content).map_err(|e| VesselAnalysisError::Io(e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.vessel_channel.trim().is_empty() {
            return Err(VesselAnalysisError::Config(
                "vessel_channel must name a channel directory".to_string(),
            ));
        }
        for (what, channel) in [
            ("microglia_channel", &self.microglia_channel),
            ("nuclei_channel", &self.nuclei_channel),
        ] {
            if matches!(channel, Some(name) if name.trim().is_empty()) {
                return Err(VesselAnalysisError::Config(format!("{} must not be empty", what)));
            }
        }

        self.default_calibration().validate()?;

        check_bounds("vessel", self.min_vessel_volume_um3, self.max_vessel_volume_um3)?;
        check_bounds("microglia", self.min_microglia_volume_um3, self.max_microglia_volume_um3)?;
        check_bounds("nucleus", self.min_nucleus_volume_um3, self.max_nucleus_volume_um3)?;

        if !(self.roi_dilation_um.is_finite() && self.roi_dilation_um >= 0.0) {
            return Err(VesselAnalysisError::Config(
                "roi_dilation_um must be >= 0.0".to_string(),
            ));
        }

        if !(self.min_branch_length_um.is_finite() && self.min_branch_length_um >= 0.0) {
            return Err(VesselAnalysisError::Config(
                "min_branch_length_um must be >= 0.0".to_string(),
            ));
        }

        if self.roi_file_name.trim().is_empty() {
            return Err(VesselAnalysisError::Config(
                "roi_file_name must not be empty".to_string(),
            ));
        }

        self.vessel_segmentation.validate()?;
        self.microglia_segmentation.validate()?;
        self.nuclei_segmentation.validate()?;

        Ok(())
    }

    pub fn default_calibration(&self) -> Calibration {
        Calibration::new(self.pixel_width_um, self.pixel_depth_um)
    }

    pub fn vessel_size(&self) -> SizeRange {
        SizeRange::new(self.min_vessel_volume_um3, self.max_vessel_volume_um3)
    }

    pub fn microglia_size(&self) -> SizeRange {
        SizeRange::new(self.min_microglia_volume_um3, self.max_microglia_volume_um3)
    }

    pub fn nucleus_size(&self) -> SizeRange {
        SizeRange::new(self.min_nucleus_volume_um3, self.max_nucleus_volume_um3)
    }
}

fn check_bounds(what: &str, min: f64, max: Option<f64>) -> Result<()> {
    if !(min.is_finite() && min >= 0.0) {
        return Err(VesselAnalysisError::Config(format!(
            "min_{}_volume_um3 must be >= 0.0",
            what
        )));
    }
    if let Some(max) = max {
        if max.is_nan() || max < min {
            return Err(VesselAnalysisError::Config(format!(
                "max_{}_volume_um3 must be >= min_{}_volume_um3",
                what, what
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(AnalysisConfig::default().validate().is_ok());
    }

    #[test]
    fn minimal_file_uses_defaults() {
        let config: AnalysisConfig =
            toml::from_str("input_path = \"in\"\noutput_base_dir = \"out\"\n").unwrap();
        assert_eq!(config.roi_dilation_um, 50.0);
        assert_eq!(config.microglia_channel.as_deref(), Some("microglia"));
        assert_eq!(config.nuclei_channel, None);
        assert_eq!(config.vessel_segmentation, SegmentationStrategy::Otsu);
        assert!(config.vessel_size().max_um3.is_none());
    }

    #[test]
    fn segmentation_tables_parse() {
        let text = r#"
            input_path = "in"
            output_base_dir = "out"

            [vessel_segmentation]
            method = "threshold"
            level = 400.0
        "#;
        let config: AnalysisConfig = toml::from_str(text).unwrap();
        assert_eq!(
            config.vessel_segmentation,
            SegmentationStrategy::Threshold { level: 400.0 }
        );
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let config = AnalysisConfig {
            min_microglia_volume_um3: 50.0,
            max_microglia_volume_um3: Some(10.0),
            ..AnalysisConfig::default()
        };
        assert!(matches!(config.validate(), Err(VesselAnalysisError::Config(_))));
    }

    #[test]
    fn negative_dilation_and_empty_channel_are_rejected() {
        let config = AnalysisConfig {
            roi_dilation_um: -1.0,
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AnalysisConfig {
            vessel_channel: " ".to_string(),
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn saved_config_loads_back() {
        let path = std::env::temp_dir().join(format!("vessel_proximity_config_{}.toml", std::process::id()));
        let config = AnalysisConfig {
            nuclei_channel: Some("nuclei".to_string()),
            max_vessel_volume_um3: Some(1e6),
            ..AnalysisConfig::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(AnalysisConfig::from_file(&path).unwrap(), config);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn parse_errors_carry_the_path() {
        let path = std::env::temp_dir().join(format!("vessel_proximity_bad_{}.toml", std::process::id()));
        fs::write(&path, "input_path = ").unwrap();
        assert!(matches!(
            AnalysisConfig::from_file(&path),
            Err(VesselAnalysisError::ConfigLoad { .. })
        ));
        fs::remove_file(&path).unwrap();
    }
}
