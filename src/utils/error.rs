//! Error Handling Module
//!
//! Defines the error taxonomy of the trainer. Every stage of a run reports
//! one of these kinds; the pipeline tags it with the failing stage.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for crop disease training operations
#[derive(Error, Debug)]
pub enum TrainerError {
    /// Dataset root is missing, not a directory, or has no classes/images
    #[error("Dataset not found at '{path}': {reason}")]
    DatasetNotFound { path: PathBuf, reason: String },

    /// An image file could not be opened or decoded
    #[error("Corrupt image '{path}': {reason}")]
    CorruptImage { path: PathBuf, reason: String },

    /// Input resolution, class layout or weights do not fit the architecture
    #[error("Incompatible shape: {0}")]
    IncompatibleShape(String),

    /// The trained model could not be persisted
    #[error("Failed to write '{path}': {reason}")]
    Write { path: PathBuf, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pretrained backbone weights could not be provided
    #[error("Weights error: {0}")]
    Weights(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TrainerError {
    /// Shorthand for a [`TrainerError::DatasetNotFound`]
    pub fn dataset_not_found(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DatasetNotFound {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`TrainerError::CorruptImage`]
    pub fn corrupt_image(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CorruptImage {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a [`TrainerError::Write`]
    pub fn write(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Write {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable, machine-friendly name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            TrainerError::DatasetNotFound { .. } => "DatasetNotFoundError",
            TrainerError::CorruptImage { .. } => "CorruptImageError",
            TrainerError::IncompatibleShape(_) => "IncompatibleShapeError",
            TrainerError::Write { .. } => "WriteError",
            TrainerError::Config(_) => "ConfigError",
            TrainerError::Weights(_) => "WeightsError",
            TrainerError::Io(_) => "IoError",
            TrainerError::Serialization(_) => "SerializationError",
        }
    }
}

impl From<serde_json::Error> for TrainerError {
    fn from(err: serde_json::Error) -> Self {
        TrainerError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for TrainerError {
    fn from(err: toml::de::Error) -> Self {
        TrainerError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TrainerError {
    fn from(err: toml::ser::Error) -> Self {
        TrainerError::Serialization(err.to_string())
    }
}

/// Convenience Result type for trainer operations
pub type Result<T> = std::result::Result<T, TrainerError>;
