//! Training module
//!
//! This module provides:
//! - The head-only training loop over a frozen backbone
//! - Optimizer and loop hyperparameters
//! - Per-epoch training history with CSV export

pub mod history;
pub mod trainer;

// Re-export main types for convenience
pub use history::{EpochMetrics, TrainingHistory};
pub use trainer::{
    categorical_cross_entropy, evaluate, train, OptimizerConfig, OptimizerKind, Trainer,
    TrainingOutcome, TrainingParams,
};
