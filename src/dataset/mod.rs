//! Dataset module for directory-structured image data
//!
//! This module provides:
//! - Class discovery and image enumeration for a split root
//! - Random augmentation for training samples, rescale-only for validation
//! - Lazy, restartable batch supply with one-hot labels

pub mod augmentation;
pub mod locator;
pub mod supplier;

// Re-export main types for convenience
pub use augmentation::{AugmentationConfig, Augmenter, FillMode};
pub use locator::{ClassIndex, DatasetLocator, DatasetStats, ImageFolder, ImageRecord};
pub use supplier::{
    BatchStream, BatchSupplier, CorruptImagePolicy, Epoch, ImageBatch, ImageBatcher, ImageItem,
    SupplierConfig,
};

use serde::{Deserialize, Serialize};

/// Target resolution every image is resized to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

impl ImageSize {
    pub fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    /// Number of values in one CHW RGB image
    pub fn num_values(&self) -> usize {
        3 * self.height as usize * self.width as usize
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}
