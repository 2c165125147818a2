//! Model module: frozen pretrained backbone + trainable classification head
//!
//! This module provides:
//! - The MobileNetV2 feature extractor (`mobilenet`)
//! - The dense classification head (`head`)
//! - Backbone weight sources (`weights`)
//! - Assembly of backbone and head into one classifier (`classifier`)

pub mod classifier;
pub mod head;
pub mod mobilenet;
pub mod weights;

// Re-export main types for convenience
pub use classifier::{Classifier, ClassifierConfig};
pub use head::{ClassificationHead, ClassificationHeadConfig};
pub use mobilenet::{MobileNetV2, MobileNetV2Config};
pub use weights::{BackboneWeights, FileWeights, ParameterSnapshot, SeededWeights, WeightSource};

use serde::{Deserialize, Serialize};

/// Pretrained backbone families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    #[default]
    MobilenetV2,
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::MobilenetV2 => write!(f, "MobileNetV2"),
        }
    }
}
