//! End-to-end run: scan → assemble → train → persist
//!
//! Each stage either completes or aborts the whole run; a failure is
//! reported together with the stage it happened in.

use std::path::{Path, PathBuf};

use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Tensor, TensorData,
};
use colored::Colorize;
use image::ImageReader;
use thiserror::Error;
use tracing::{info, warn};

use crate::artifact::{ArtifactManifest, ArtifactPaths, ArtifactWriter};
use crate::backend::{default_device, DefaultBackend, TrainingBackend};
use crate::config::TrainerConfig;
use crate::dataset::{
    Augmenter, BatchSupplier, ClassIndex, DatasetLocator, DatasetStats, SupplierConfig,
};
use crate::training::{self, TrainingHistory};
use crate::utils::error::TrainerError;

/// Phases of a run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuring,
    Scanning,
    Assembling,
    Training,
    Persisting,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Configuring => "configuration",
            Stage::Scanning => "dataset scan",
            Stage::Assembling => "model assembly",
            Stage::Training => "training",
            Stage::Persisting => "saving",
        };
        f.write_str(name)
    }
}

/// A [`TrainerError`] tagged with the stage that produced it
#[derive(Error, Debug)]
#[error("{stage} failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: TrainerError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineError>;
}

impl<T> AtStage<T> for crate::utils::error::Result<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|source| PipelineError { stage, source })
    }
}

/// What a completed run produced
#[derive(Debug)]
pub struct RunSummary {
    pub classes: ClassIndex,
    pub validation_classes: ClassIndex,
    pub train_samples: usize,
    pub validation_samples: usize,
    pub batches_per_epoch: usize,
    pub output_width: usize,
    pub history: TrainingHistory,
    pub artifact: ArtifactPaths,
}

/// Run the whole pipeline on the compile-time selected backend
pub fn run(config: &TrainerConfig) -> Result<RunSummary, PipelineError> {
    let device = default_device();
    run_with_backend::<TrainingBackend>(config, &device)
}

/// Run the whole pipeline on backend `B`
pub fn run_with_backend<B: AutodiffBackend>(
    config: &TrainerConfig,
    device: &B::Device,
) -> Result<RunSummary, PipelineError> {
    config.validate().at(Stage::Configuring)?;
    let image_size = config.image_size();

    // Scan
    info!("Scanning datasets");
    let locator = DatasetLocator::new(&config.data.extensions);
    let train_folder = locator.locate(&config.data.train_dir).at(Stage::Scanning)?;
    println!(
        "Found {} images belonging to {} classes.",
        train_folder.records.len(),
        train_folder.num_classes()
    );
    let val_folder = locator
        .locate(&config.data.validation_dir)
        .at(Stage::Scanning)?;
    println!(
        "Found {} images belonging to {} classes.",
        val_folder.records.len(),
        val_folder.num_classes()
    );

    train_folder.stats().print("Training Data");

    let classes = train_folder.classes.clone();
    let validation_classes = val_folder.classes.clone();
    println!(
        "{} {}",
        "Classes found in training data:".cyan(),
        classes
    );
    println!(
        "{} {}",
        "Classes found in validation data:".cyan(),
        validation_classes
    );
    classes
        .ensure_matches(&validation_classes)
        .at(Stage::Scanning)?;

    // Assemble
    info!("Assembling classifier");
    B::seed(device, config.training.seed);
    let classifier_config = config.classifier(classes.len());
    let model = classifier_config
        .assemble::<B, _>(&config.model.weights, device)
        .at(Stage::Assembling)?;
    let output_width = model.num_classes();

    // Train
    let train_samples = train_folder.records.len();
    let validation_samples = val_folder.records.len();
    let mut train_supplier = BatchSupplier::<B>::new(
        train_folder,
        Augmenter::new(config.augmentation.clone(), image_size),
        SupplierConfig::training(
            config.data.batch_size,
            config.data.corrupt_images,
            config.training.seed,
        ),
        device.clone(),
    )
    .at(Stage::Training)?;
    let mut val_supplier = BatchSupplier::<B::InnerBackend>::new(
        val_folder,
        Augmenter::new(config.augmentation.to_validation(), image_size),
        SupplierConfig::validation(config.data.batch_size, config.data.corrupt_images),
        device.clone(),
    )
    .at(Stage::Training)?;
    let batches_per_epoch = train_supplier.batches_per_epoch();

    println!("{}", "Starting Training...".green().bold());
    println!();
    let outcome = training::train(
        model,
        &config.optimizer,
        &config.training,
        &mut train_supplier,
        &mut val_supplier,
    )
    .at(Stage::Training)?;

    if let Some(last) = outcome.history.last() {
        println!("{}", "Training Complete!".green().bold());
        println!(
            "  Final: loss {:.4} | acc {:.2}% | val loss {:.4} | val acc {:.2}%",
            last.loss,
            last.accuracy * 100.0,
            last.val_loss,
            last.val_accuracy * 100.0
        );
    }

    // Persist
    if let Some(csv) = &config.output.metrics_csv {
        match outcome.history.save_csv(csv) {
            Ok(()) => info!("Wrote training history to {}", csv.display()),
            Err(e) => warn!("Training history not written: {}", e),
        }
    }

    let manifest = ArtifactManifest::new(
        classifier_config,
        &classes,
        config.augmentation.rescale,
        outcome.history.clone(),
    );
    println!(
        "{} {}",
        "Classes found in training data:".cyan(),
        classes
    );
    println!(
        "{} {}",
        "Classes found in validation data:".cyan(),
        validation_classes
    );

    let artifact = ArtifactWriter::new(&config.output.artifact_path)
        .save(&outcome.model, &manifest)
        .at(Stage::Persisting)?;
    println!(
        "{} {}",
        "Model saved to".green(),
        artifact.weights.display()
    );

    Ok(RunSummary {
        classes,
        validation_classes,
        train_samples,
        validation_samples,
        batches_per_epoch,
        output_width,
        history: outcome.history,
        artifact,
    })
}

/// Scan a split without training
pub fn inspect<P: AsRef<Path>>(
    root: P,
    extensions: &[String],
) -> crate::utils::error::Result<DatasetStats> {
    let folder = DatasetLocator::new(extensions).locate(root)?;
    Ok(folder.stats())
}

/// Top class of one image
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub path: PathBuf,
    pub class_name: String,
    pub class_index: usize,
    pub probability: f32,
}

/// Classify image files with a saved artifact, preprocessing them the way
/// validation images were during training
pub fn predict<B: Backend>(
    artifact_base: &Path,
    images: &[PathBuf],
    device: &B::Device,
) -> crate::utils::error::Result<Vec<Prediction>> {
    let writer = ArtifactWriter::new(artifact_base);
    let (model, manifest) = writer.load::<B>(device)?;
    let classes = manifest.classes();
    let augmenter = Augmenter::validation(manifest.rescale, manifest.input_size);
    let size = manifest.input_size;

    let mut predictions = Vec::with_capacity(images.len());
    for path in images {
        let img = ImageReader::open(path)
            .map_err(|e| TrainerError::corrupt_image(path, e))?
            .with_guessed_format()
            .map_err(|e| TrainerError::corrupt_image(path, e))?
            .decode()
            .map_err(|e| TrainerError::corrupt_image(path, e))?;
        let pixels = augmenter.preprocess(&img, None);
        let input = Tensor::<B, 4>::from_floats(
            TensorData::new(pixels, [1, 3, size.height as usize, size.width as usize]),
            device,
        );

        let probs: Vec<f32> = model
            .forward_probabilities(input)
            .into_data()
            .iter::<f32>()
            .collect();
        let (class_index, probability) = top_class(&probs).ok_or_else(|| {
            TrainerError::IncompatibleShape(format!(
                "{} produced no usable probabilities for {}",
                artifact_base.display(),
                path.display()
            ))
        })?;

        predictions.push(Prediction {
            path: path.clone(),
            class_name: classes.name_of(class_index).unwrap_or("?").to_string(),
            class_index,
            probability,
        });
    }
    Ok(predictions)
}

/// Index and value of the largest probability, ignoring NaN entries
fn top_class(probs: &[f32]) -> Option<(usize, f32)> {
    probs
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, p)| !p.is_nan())
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// [`predict`] on the compile-time selected inference backend
pub fn predict_default(
    artifact_base: &Path,
    images: &[PathBuf],
) -> crate::utils::error::Result<Vec<Prediction>> {
    predict::<DefaultBackend>(artifact_base, images, &default_device())
}
