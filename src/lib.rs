// src/lib.rs - Library interface for vessel/cell spatial relationship analysis

pub mod clip;
pub mod composite;
pub mod config;
pub mod distance;
pub mod errors;
pub mod image_io;
pub mod labeling;
pub mod morphology;
pub mod object3d;
pub mod output;
pub mod pipeline;
pub mod proximity;
pub mod results;
pub mod roi;
pub mod segmentation;
pub mod skeleton_graph;
pub mod volume;

// Re-export commonly used types and functions
pub use errors::{Result, VesselAnalysisError};
pub use config::AnalysisConfig;
pub use pipeline::{analyse_image, process_image, process_roi, SegmentedImage};
pub use image_io::{discover_images, ImageEntry};

pub use volume::{BinaryVolume, Calibration, Idx3d};
pub use object3d::{ObjectPopulation, VolumetricObject};
pub use distance::{inverse_field, normal_field, DistanceField, DistanceTransformer, ExactEdt};
pub use roi::{RoiShape, RoiTrack};
pub use clip::{filter_objects_by_centroid, VolumeClipper};
pub use morphology::skeletonize;
pub use skeleton_graph::{prune_short_branches, SkeletonGraph, SkeletonMetrics};
pub use proximity::{Category, CategoryTally, ProximityClassifier, RelationshipRecord};
pub use results::ResultsAggregator;
pub use segmentation::{SegmentationStrategy, SizeRange};
