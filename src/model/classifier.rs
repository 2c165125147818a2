//! Backbone + Head Assembler

use burn::{
    config::Config,
    module::Module,
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use tracing::info;

use crate::dataset::ImageSize;
use crate::model::head::{ClassificationHead, ClassificationHeadConfig};
use crate::model::mobilenet::{MobileNetV2, MobileNetV2Config};
use crate::model::weights::WeightSource;
use crate::model::Architecture;
use crate::utils::error::{self, TrainerError};

/// Everything needed to rebuild a classifier's structure
#[derive(Config, Debug, PartialEq)]
pub struct ClassifierConfig {
    pub num_classes: usize,
    pub input_size: ImageSize,
    #[config(default = "Architecture::MobilenetV2")]
    pub architecture: Architecture,
    #[config(default = "1.0")]
    pub width_multiplier: f64,
    #[config(default = "128")]
    pub hidden_units: usize,
    #[config(default = "0.5")]
    pub dropout: f64,
}

impl ClassifierConfig {
    pub fn backbone(&self) -> MobileNetV2Config {
        MobileNetV2Config::new().with_width_multiplier(self.width_multiplier)
    }

    /// Reject structures the backbone cannot be built for
    pub fn validate(&self) -> error::Result<()> {
        if self.num_classes == 0 {
            return Err(TrainerError::IncompatibleShape(
                "a classifier needs at least one class".into(),
            ));
        }
        if self.hidden_units == 0 {
            return Err(TrainerError::Config("hidden_units must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TrainerError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        self.backbone().validate_input(self.input_size)
    }

    /// Build the classifier: backbone from `weights` (frozen), fresh head on top
    pub fn assemble<B: Backend, W: WeightSource<B>>(
        &self,
        weights: &W,
        device: &B::Device,
    ) -> error::Result<Classifier<B>> {
        self.validate()?;

        let backbone = weights.load_backbone(&self.backbone(), device)?.no_grad();
        let head = self.init_head(backbone.out_channels(), device);

        info!(
            "Assembled {} (width {}) from {} with a {}-unit head over {} classes",
            self.architecture,
            self.width_multiplier,
            weights.describe(),
            self.hidden_units,
            self.num_classes
        );

        Ok(Classifier { backbone, head })
    }

    /// Same structure with freshly initialised parameters, used as the
    /// template a saved record is loaded into.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<Classifier<B>> {
        self.validate()?;
        let backbone = self.backbone().init::<B>(device).no_grad();
        let head = self.init_head(backbone.out_channels(), device);
        Ok(Classifier { backbone, head })
    }

    fn init_head<B: Backend>(&self, features: usize, device: &B::Device) -> ClassificationHead<B> {
        ClassificationHeadConfig::new(features, self.num_classes)
            .with_hidden_units(self.hidden_units)
            .with_dropout(self.dropout)
            .init(device)
    }
}

/// Frozen feature extractor with a trainable dense head
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    pub backbone: MobileNetV2<B>,
    pub head: ClassificationHead<B>,
}

impl<B: Backend> Classifier<B> {
    /// Logits of shape [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// Class probabilities (softmax over logits)
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }
}
