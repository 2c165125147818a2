//! Run configuration
//!
//! One [`TrainerConfig`] is created at process start (defaults, a TOML file,
//! then CLI overrides) and passed read-only to every stage.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::augmentation::AugmentationConfig;
use crate::dataset::locator::DEFAULT_EXTENSIONS;
use crate::dataset::supplier::CorruptImagePolicy;
use crate::dataset::ImageSize;
use crate::model::{Architecture, BackboneWeights, ClassifierConfig};
use crate::training::{OptimizerConfig, TrainingParams};
use crate::utils::error::{Result, TrainerError};

/// Complete configuration of a training run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub data: DataConfig,
    pub augmentation: AugmentationConfig,
    pub model: ModelConfig,
    pub optimizer: OptimizerConfig,
    pub training: TrainingParams,
    pub output: OutputConfig,
}

/// Dataset locations and batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub train_dir: PathBuf,
    pub validation_dir: PathBuf,
    pub image_height: u32,
    pub image_width: u32,
    pub batch_size: usize,
    pub corrupt_images: CorruptImagePolicy,
    /// Accepted image file extensions (case-insensitive)
    pub extensions: Vec<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("data/train"),
            validation_dir: PathBuf::from("data/validation"),
            image_height: 2592,
            image_width: 1728,
            batch_size: 32,
            corrupt_images: CorruptImagePolicy::Skip,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Backbone choice and head hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub width_multiplier: f64,
    pub weights: BackboneWeights,
    pub hidden_units: usize,
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::MobilenetV2,
            width_multiplier: 1.0,
            weights: BackboneWeights::default(),
            hidden_units: 128,
            dropout: 0.5,
        }
    }
}

/// Where the trained model and reports go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Weights are written to `<artifact_path>.mpk`, the manifest to `<artifact_path>.json`
    pub artifact_path: PathBuf,
    pub metrics_csv: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("crop_disease_mobilenetv2"),
            metrics_csv: None,
        }
    }
}

impl TrainerConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration as TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| TrainerError::write(parent, e))?;
        }
        std::fs::write(path, self.to_toml_string()?).map_err(|e| TrainerError::write(path, e))
    }

    pub fn image_size(&self) -> ImageSize {
        ImageSize::new(self.data.image_height, self.data.image_width)
    }

    /// Classifier structure for a given number of discovered classes
    pub fn classifier(&self, num_classes: usize) -> ClassifierConfig {
        ClassifierConfig::new(num_classes, self.image_size())
            .with_architecture(self.model.architecture)
            .with_width_multiplier(self.model.width_multiplier)
            .with_hidden_units(self.model.hidden_units)
            .with_dropout(self.model.dropout)
    }

    /// Reject settings no stage can run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(TrainerError::Config(msg));

        if self.data.batch_size == 0 {
            return fail("data.batch_size must be at least 1".into());
        }
        if self.data.image_height == 0 || self.data.image_width == 0 {
            return fail("data.image_height and data.image_width must be positive".into());
        }
        if self.data.extensions.is_empty() {
            return fail("data.extensions must list at least one extension".into());
        }
        if self.training.epochs == 0 {
            return fail("training.epochs must be at least 1".into());
        }
        if self.model.hidden_units == 0 {
            return fail("model.hidden_units must be at least 1".into());
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return fail(format!(
                "model.dropout must be in [0, 1), got {}",
                self.model.dropout
            ));
        }
        if let Err(msg) = self.optimizer.validate() {
            return fail(format!("optimizer: {}", msg));
        }
        if let Err(msg) = self.augmentation.validate() {
            return fail(format!("augmentation: {}", msg));
        }
        Ok(())
    }
}
