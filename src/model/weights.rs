//! Sources of backbone parameters
//!
//! Pretrained ImageNet weights are consumed as a Burn record of
//! [`MobileNetV2`] (converted offline). A seeded initialisation stands in for
//! them when no record is available.

use std::path::{Path, PathBuf};

use burn::{
    module::{Module, ModuleVisitor, Param},
    record::{FullPrecisionSettings, NamedMpkFileRecorder, RecorderError},
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::mobilenet::{MobileNetV2, MobileNetV2Config};
use crate::utils::error::{Result, TrainerError};

/// Supplies an initialised backbone for a given architecture
pub trait WeightSource<B: Backend> {
    fn load_backbone(&self, config: &MobileNetV2Config, device: &B::Device)
        -> Result<MobileNetV2<B>>;

    /// Short human-readable description for logs
    fn describe(&self) -> String;
}

/// Pretrained parameters stored as a full-precision named MessagePack record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWeights {
    pub path: PathBuf,
}

impl<B: Backend> WeightSource<B> for FileWeights {
    fn load_backbone(
        &self,
        config: &MobileNetV2Config,
        device: &B::Device,
    ) -> Result<MobileNetV2<B>> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let model = config.init::<B>(device);
        let expected = ParameterSnapshot::shapes_of(&model);

        let model = model
            .load_file(self.path.clone(), &recorder, device)
            .map_err(|e| match e {
                RecorderError::FileNotFound(_) => TrainerError::Weights(format!(
                    "pretrained weights not found at {}",
                    self.path.display()
                )),
                other => TrainerError::IncompatibleShape(format!(
                    "weights at {} do not describe this backbone: {}",
                    self.path.display(),
                    other
                )),
            })?;

        let loaded = ParameterSnapshot::shapes_of(&model);
        if loaded != expected {
            return Err(TrainerError::IncompatibleShape(format!(
                "weights at {} have different tensor shapes than a MobileNetV2 with width multiplier {}",
                self.path.display(),
                config.width_multiplier
            )));
        }

        info!("Loaded backbone weights from {}", self.path.display());
        Ok(model)
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Deterministic random initialisation from the backend RNG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededWeights {
    pub seed: u64,
}

impl<B: Backend> WeightSource<B> for SeededWeights {
    fn load_backbone(
        &self,
        config: &MobileNetV2Config,
        device: &B::Device,
    ) -> Result<MobileNetV2<B>> {
        B::seed(device, self.seed);
        Ok(config.init::<B>(device))
    }

    fn describe(&self) -> String {
        format!("seeded init ({})", self.seed)
    }
}

/// Backbone weight selection as written in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackboneWeights {
    File { path: PathBuf },
    Seeded { seed: u64 },
}

impl Default for BackboneWeights {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("weights/mobilenet_v2_imagenet.mpk"),
        }
    }
}

impl BackboneWeights {
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl<B: Backend> WeightSource<B> for BackboneWeights {
    fn load_backbone(
        &self,
        config: &MobileNetV2Config,
        device: &B::Device,
    ) -> Result<MobileNetV2<B>> {
        match self {
            Self::File { path } => FileWeights { path: path.clone() }.load_backbone(config, device),
            Self::Seeded { seed } => SeededWeights { seed: *seed }.load_backbone(config, device),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::File { path } => {
                <FileWeights as WeightSource<B>>::describe(&FileWeights { path: path.clone() })
            }
            Self::Seeded { seed } => {
                <SeededWeights as WeightSource<B>>::describe(&SeededWeights { seed: *seed })
            }
        }
    }
}

/// Copy of every float tensor in a module, in visiting order.
/// BatchNorm running statistics are included.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSnapshot {
    pub shapes: Vec<Vec<usize>>,
    pub values: Vec<Vec<f32>>,
}

impl ParameterSnapshot {
    pub fn of<B: Backend, M: Module<B>>(module: &M) -> Self {
        let mut visitor = SnapshotVisitor {
            snapshot: Self {
                shapes: Vec::new(),
                values: Vec::new(),
            },
            with_values: true,
        };
        module.visit(&mut visitor);
        visitor.snapshot
    }

    pub fn shapes_of<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
        let mut visitor = SnapshotVisitor {
            snapshot: Self {
                shapes: Vec::new(),
                values: Vec::new(),
            },
            with_values: false,
        };
        module.visit(&mut visitor);
        visitor.snapshot.shapes
    }

    /// True when both snapshots hold the same bits in every value
    pub fn bit_identical(&self, other: &Self) -> bool {
        self.shapes == other.shapes
            && self.values.len() == other.values.len()
            && self.values.iter().zip(&other.values).all(|(a, b)| {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            })
    }
}

struct SnapshotVisitor {
    snapshot: ParameterSnapshot,
    with_values: bool,
}

impl<B: Backend> ModuleVisitor<B> for SnapshotVisitor {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        self.snapshot.shapes.push(tensor.dims().to_vec());
        if self.with_values {
            self.snapshot
                .values
                .push(tensor.into_data().iter::<f32>().collect());
        }
    }
}
