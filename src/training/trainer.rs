//! Head-only training loop
//!
//! The backbone is taken out of the autodiff graph once, as its inference
//! copy, and run on the inner backend for every batch; its features enter
//! the graph only at the head. Only the head is handed to the optimizer, so
//! the backbone (BatchNorm running statistics included) is never modified.

use burn::{
    module::AutodiffModule,
    optim::{momentum::MomentumConfig, AdamConfig, GradientsParams, Optimizer, SgdConfig},
    tensor::{
        activation::log_softmax,
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::{BatchSupplier, ImageBatch};
use crate::model::{ClassificationHead, Classifier, MobileNetV2};
use crate::training::history::{EpochMetrics, TrainingHistory};
use crate::utils::error::{Result, TrainerError};
use crate::utils::logging::TrainingLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    Sgd,
}

/// Optimizer hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    /// Adam only
    pub beta_1: f32,
    /// Adam only
    pub beta_2: f32,
    /// Adam only
    pub epsilon: f32,
    /// SGD only, 0 disables momentum
    pub momentum: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            learning_rate: 0.001,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
            momentum: 0.0,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.learning_rate > 0.0) {
            return Err(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            ));
        }
        if !(0.0..1.0).contains(&self.beta_1) || !(0.0..1.0).contains(&self.beta_2) {
            return Err("beta_1 and beta_2 must be in [0, 1)".to_string());
        }
        if self.epsilon <= 0.0 {
            return Err("epsilon must be positive".to_string());
        }
        if self.momentum < 0.0 {
            return Err("momentum must be non-negative".to_string());
        }
        Ok(())
    }
}

/// Loop parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub epochs: usize,
    /// Seeds shuffling, augmentation and seeded backbone weights
    pub seed: u64,
    /// Print running metrics every this many batches (0 disables)
    pub log_interval: usize,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 10,
            seed: 42,
            log_interval: 10,
        }
    }
}

/// Trained inference model and the history of the run
#[derive(Debug)]
pub struct TrainingOutcome<B: Backend> {
    pub model: Classifier<B>,
    pub history: TrainingHistory,
}

/// Sums over one pass of a supplier
#[derive(Debug, Default, Clone, Copy)]
struct PassTotals {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl PassTotals {
    fn add(&mut self, loss: f64, correct: usize, samples: usize) {
        self.loss_sum += loss * samples as f64;
        self.correct += correct;
        self.samples += samples;
    }

    fn loss(&self) -> f64 {
        self.loss_sum / self.samples.max(1) as f64
    }

    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.samples.max(1) as f64
    }
}

/// Categorical cross-entropy between logits and one-hot labels
pub fn categorical_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 2>,
) -> Tensor<B, 1> {
    (labels * log_softmax(logits, 1))
        .sum_dim(1)
        .mean()
        .neg()
}

/// Number of rows whose arg-max matches the target class
pub fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let predictions = logits.argmax(1).squeeze_dim::<1>(1);
    let correct: i64 = predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}

/// Loss and accuracy of a classifier over one full pass of `supplier`
pub fn evaluate<B: Backend>(
    model: &Classifier<B>,
    supplier: &mut BatchSupplier<B>,
) -> Result<(f64, f64)> {
    let mut totals = PassTotals::default();
    for batch in supplier.epoch() {
        let ImageBatch {
            images,
            labels,
            targets,
        } = batch?;
        let samples = targets.dims()[0];
        let logits = model.forward(images);

        let loss: f64 = categorical_cross_entropy(logits.clone(), labels)
            .into_scalar()
            .elem();
        totals.add(loss, count_correct(logits, targets), samples);
    }

    if totals.samples == 0 {
        return Err(TrainerError::dataset_not_found(
            &supplier.folder().root,
            "no readable images in this split",
        ));
    }
    Ok((totals.loss(), totals.accuracy()))
}

/// Trains the head of a [`Classifier`] on top of its frozen backbone
pub struct Trainer<B: AutodiffBackend, O> {
    backbone: MobileNetV2<B::InnerBackend>,
    head: ClassificationHead<B>,
    optimizer: O,
    learning_rate: f64,
    params: TrainingParams,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ClassificationHead<B>, B>,
{
    pub fn new(model: Classifier<B>, optimizer: O, learning_rate: f64, params: TrainingParams) -> Self {
        Self {
            backbone: model.backbone.valid(),
            head: model.head,
            optimizer,
            learning_rate,
            params,
        }
    }

    /// Run every epoch: one training pass then one validation pass
    pub fn fit(
        mut self,
        train: &mut BatchSupplier<B>,
        validation: &mut BatchSupplier<B::InnerBackend>,
    ) -> Result<TrainingOutcome<B::InnerBackend>> {
        let epochs = self.params.epochs;
        let mut history = TrainingHistory::new();
        let mut logger = TrainingLogger::new(epochs);

        info!(
            "Training on {} samples, validating on {} samples for {} epochs",
            train.num_samples(),
            validation.num_samples(),
            epochs
        );

        for epoch in 0..epochs {
            println!(
                "{}",
                format!("Epoch {}/{}", epoch + 1, epochs).yellow().bold()
            );
            logger.start_epoch(epoch);

            let (totals, skipped) = self.train_epoch(train)?;
            let (val_loss, val_accuracy) = evaluate(&self.inference_model(), validation)?;

            let metrics = EpochMetrics {
                epoch: epoch + 1,
                loss: totals.loss(),
                accuracy: totals.accuracy(),
                val_loss,
                val_accuracy,
                duration_secs: logger.epoch_elapsed(),
                skipped_images: skipped,
            };

            println!(
                "  {} Loss: {:.4} | Acc: {:.2}% | Val Loss: {:.4} | Val Acc: {:.2}%",
                "→".cyan(),
                metrics.loss,
                metrics.accuracy * 100.0,
                metrics.val_loss,
                metrics.val_accuracy * 100.0
            );
            println!();

            logger.end_epoch(
                metrics.loss,
                metrics.accuracy,
                metrics.val_loss,
                metrics.val_accuracy,
            );
            history.push(metrics);
        }

        logger.log_complete(history.last().map(|m| m.val_accuracy).unwrap_or(0.0));

        Ok(TrainingOutcome {
            model: self.inference_model(),
            history,
        })
    }

    fn train_epoch(&mut self, train: &mut BatchSupplier<B>) -> Result<(PassTotals, usize)> {
        let mut totals = PassTotals::default();
        let log_interval = self.params.log_interval;

        let mut epoch = train.epoch();
        let num_batches = epoch.expected_batches();
        let mut batch_idx = 0;

        while let Some(batch) = epoch.next() {
            let ImageBatch {
                images,
                labels,
                targets,
            } = batch?;
            let samples = targets.dims()[0];

            let features = Tensor::<B, 4>::from_inner(self.backbone.forward(images.inner()));
            let logits = self.head.forward(features);
            let loss = categorical_cross_entropy(logits.clone(), labels);

            let loss_value: f64 = loss.clone().into_scalar().elem();
            totals.add(loss_value, count_correct(logits, targets), samples);

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.head);
            self.head = self
                .optimizer
                .step(self.learning_rate, self.head.clone(), grads);

            batch_idx += 1;
            if log_interval > 0 && (batch_idx % log_interval == 0 || batch_idx == num_batches) {
                println!(
                    "  Batch {:>4}/{}: loss = {:.4}, acc = {:.2}%",
                    batch_idx,
                    num_batches,
                    loss_value,
                    totals.accuracy() * 100.0
                );
            }
        }

        let skipped = epoch.skipped();
        if totals.samples == 0 {
            return Err(TrainerError::dataset_not_found(
                &train.folder().root,
                "no readable images in this split",
            ));
        }
        Ok((totals, skipped))
    }

    fn inference_model(&self) -> Classifier<B::InnerBackend> {
        Classifier {
            backbone: self.backbone.clone(),
            head: self.head.valid(),
        }
    }
}

/// Build the configured optimizer for the head and run [`Trainer::fit`]
pub fn train<B: AutodiffBackend>(
    model: Classifier<B>,
    optimizer: &OptimizerConfig,
    params: &TrainingParams,
    train: &mut BatchSupplier<B>,
    validation: &mut BatchSupplier<B::InnerBackend>,
) -> Result<TrainingOutcome<B::InnerBackend>> {
    let lr = optimizer.learning_rate;
    match optimizer.kind {
        OptimizerKind::Adam => {
            let adam = AdamConfig::new()
                .with_beta_1(optimizer.beta_1)
                .with_beta_2(optimizer.beta_2)
                .with_epsilon(optimizer.epsilon)
                .init::<B, ClassificationHead<B>>();
            Trainer::new(model, adam, lr, params.clone()).fit(train, validation)
        }
        OptimizerKind::Sgd => {
            let momentum = (optimizer.momentum > 0.0)
                .then(|| MomentumConfig::new().with_momentum(optimizer.momentum));
            let sgd = SgdConfig::new()
                .with_momentum(momentum)
                .init::<B, ClassificationHead<B>>();
            Trainer::new(model, sgd, lr, params.clone()).fit(train, validation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{
        Augmenter, AugmentationConfig, CorruptImagePolicy, DatasetLocator, ImageSize,
        SupplierConfig,
    };
    use crate::model::{ClassifierConfig, ParameterSnapshot, SeededWeights};
    use burn::backend::Autodiff;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Rgb};
    use std::path::Path;
    use tempfile::TempDir;

    type Inner = NdArray;
    type AdBackend = Autodiff<NdArray>;

    const SIZE: ImageSize = ImageSize {
        height: 32,
        width: 32,
    };

    fn make_split(root: &Path, per_class: usize) {
        for (c, class) in ["blight", "healthy"].iter().enumerate() {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let img = ImageBuffer::from_fn(40, 40, |x, y| {
                    let base = if c == 0 { 200u8 } else { 30u8 };
                    Rgb([base, ((x + y) as u8).wrapping_mul(3), (i * 10) as u8])
                });
                img.save(dir.join(format!("{}.png", i))).unwrap();
            }
        }
    }

    #[test]
    fn test_cross_entropy_of_confident_prediction() {
        let device = Default::default();
        let logits = Tensor::<Inner, 2>::from_floats(
            TensorData::new(vec![10.0f32, -10.0, -10.0, 10.0], [2, 2]),
            &device,
        );
        let labels = Tensor::<Inner, 2>::from_floats(
            TensorData::new(vec![1.0f32, 0.0, 0.0, 1.0], [2, 2]),
            &device,
        );
        let loss: f32 = categorical_cross_entropy(logits, labels).into_scalar();
        assert!(loss >= 0.0 && loss < 1e-4);
    }

    #[test]
    fn test_cross_entropy_of_uniform_prediction() {
        let device = Default::default();
        let logits = Tensor::<Inner, 2>::zeros([3, 4], &device);
        let labels = Tensor::<Inner, 2>::from_floats(
            TensorData::new(
                vec![1.0f32, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
                [3, 4],
            ),
            &device,
        );
        let loss: f32 = categorical_cross_entropy(logits, labels).into_scalar();
        assert!((loss - 4.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_count_correct() {
        let device = Default::default();
        let logits = Tensor::<Inner, 2>::from_floats(
            TensorData::new(vec![0.9f32, 0.1, 0.2, 0.8, 0.6, 0.4], [3, 2]),
            &device,
        );
        let targets = Tensor::<Inner, 1, Int>::from_data(TensorData::new(vec![0i64, 1, 1], [3]), &device);
        assert_eq!(count_correct(logits, targets), 2);

        let single = Tensor::<Inner, 2>::from_floats(TensorData::new(vec![0.1f32, 0.9], [1, 2]), &device);
        let target = Tensor::<Inner, 1, Int>::from_data(TensorData::new(vec![1i64], [1]), &device);
        assert_eq!(count_correct(single, target), 1);
    }

    #[test]
    fn test_optimizer_config_validation() {
        assert!(OptimizerConfig::default().validate().is_ok());
        let bad = OptimizerConfig {
            learning_rate: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_training_updates_head_and_keeps_backbone() {
        let tmp = TempDir::new().unwrap();
        let train_root = tmp.path().join("train");
        let val_root = tmp.path().join("validation");
        make_split(&train_root, 3);
        make_split(&val_root, 2);

        let locator = DatasetLocator::default();
        let mut train_supplier = BatchSupplier::<AdBackend>::new(
            locator.locate(&train_root).unwrap(),
            Augmenter::new(AugmentationConfig::default(), SIZE),
            SupplierConfig::training(4, CorruptImagePolicy::Skip, 42),
            Default::default(),
        )
        .unwrap();
        let mut val_supplier = BatchSupplier::<Inner>::new(
            locator.locate(&val_root).unwrap(),
            Augmenter::validation(1.0 / 255.0, SIZE),
            SupplierConfig::validation(4, CorruptImagePolicy::Skip),
            Default::default(),
        )
        .unwrap();

        let device = Default::default();
        let model = ClassifierConfig::new(2, SIZE)
            .with_width_multiplier(0.35)
            .with_hidden_units(16)
            .assemble::<AdBackend, _>(&SeededWeights { seed: 7 }, &device)
            .unwrap();
        let backbone_before = ParameterSnapshot::of(&model.backbone);
        let head_before = ParameterSnapshot::of(&model.head);

        let params = TrainingParams {
            epochs: 2,
            seed: 42,
            log_interval: 1,
        };
        let outcome = train(
            model,
            &OptimizerConfig::default(),
            &params,
            &mut train_supplier,
            &mut val_supplier,
        )
        .unwrap();

        assert_eq!(outcome.history.len(), 2);
        for m in &outcome.history.epochs {
            assert!(m.loss.is_finite() && m.val_loss.is_finite());
            assert!((0.0..=1.0).contains(&m.accuracy));
            assert!((0.0..=1.0).contains(&m.val_accuracy));
        }

        assert!(ParameterSnapshot::of(&outcome.model.backbone).bit_identical(&backbone_before));
        assert!(!ParameterSnapshot::of(&outcome.model.head).bit_identical(&head_before));
    }
}
