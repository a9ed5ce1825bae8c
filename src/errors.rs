// src/errors.rs - Error type shared by the library and the CLI

use thiserror::Error;
use std::io;
use std::path::PathBuf;

/// Error types for the vessel proximity analysis
#[derive(Error, Debug)]
pub enum VesselAnalysisError {
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot decode or encode image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot parse configuration {path}: {source}")]
    ConfigLoad {
        source: toml::de::Error,
        path: PathBuf,
    },

    #[error("Cannot write results table: {0}")]
    CsvOutput(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ROI error: {0}")]
    Roi(String),

    #[error("Volume error: {0}")]
    Volume(String),

    #[error("Path not found or unusable: {0}")]
    InvalidPath(PathBuf),
}

pub type Result<T> = std::result::Result<T, VesselAnalysisError>;
