//! # Crop Disease Trainer
//!
//! Transfer-learning image classifier trainer built on the Burn framework:
//! a pretrained MobileNetV2 backbone is frozen and a small dense head is
//! trained on top of it, from images organised as one directory per class.
//!
//! ## Modules
//!
//! - `dataset`: Class discovery, augmentation and lazy batch supply
//! - `model`: MobileNetV2 backbone, classification head, weight sources
//! - `training`: Head-only training loop and history
//! - `artifact`: Saving and loading trained classifiers
//! - `pipeline`: The end-to-end run (scan → assemble → train → persist)
//! - `config`: Run configuration
//! - `utils`: Logging, errors, and helper functions
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use crop_disease_trainer::{pipeline, TrainerConfig};
//!
//! let config = TrainerConfig::load("trainer.toml")?;
//! let summary = pipeline::run(&config)?;
//! println!("saved to {}", summary.artifact.weights.display());
//! ```

pub mod artifact;
pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod pipeline;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use artifact::{ArtifactManifest, ArtifactPaths, ArtifactWriter};
pub use config::TrainerConfig;
pub use dataset::{BatchSupplier, ClassIndex, DatasetLocator, ImageBatch, ImageSize};
pub use model::{BackboneWeights, Classifier, ClassifierConfig, WeightSource};
pub use pipeline::{PipelineError, RunSummary, Stage};
pub use training::{Trainer, TrainingHistory};
pub use utils::error::{Result, TrainerError};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
