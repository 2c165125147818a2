//! Artifact Writer
//!
//! A trained classifier is persisted as two files sharing one base path:
//! `<base>.mpk`, the full-precision Burn record of backbone and head, and
//! `<base>.json`, a manifest with the structure, class map, preprocessing
//! and training history needed to use the record without the dataset.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, RecorderError},
    tensor::backend::Backend,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::locator::ClassIndex;
use crate::dataset::ImageSize;
use crate::model::{Classifier, ClassifierConfig, ParameterSnapshot};
use crate::training::TrainingHistory;
use crate::utils::error::{Result, TrainerError};

/// Bumped whenever the manifest layout changes incompatibly
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const WEIGHTS_EXTENSION: &str = "mpk";
const MANIFEST_EXTENSION: &str = "json";

/// Description of a saved classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub format_version: u32,
    pub classifier: ClassifierConfig,
    /// Class name to output index
    pub class_indices: BTreeMap<String, usize>,
    pub input_size: ImageSize,
    /// Pixel scale factor the model was trained with
    pub rescale: f32,
    pub history: TrainingHistory,
    pub created_at: DateTime<Utc>,
}

impl ArtifactManifest {
    pub fn new(
        classifier: ClassifierConfig,
        classes: &ClassIndex,
        rescale: f32,
        history: TrainingHistory,
    ) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            input_size: classifier.input_size,
            classifier,
            class_indices: classes.to_map(),
            rescale,
            history,
            created_at: Utc::now(),
        }
    }

    /// Class names ordered by output index
    pub fn classes(&self) -> ClassIndex {
        ClassIndex::new(self.class_indices.keys().cloned())
    }

    fn check(&self, path: &Path) -> Result<()> {
        if self.format_version != MANIFEST_FORMAT_VERSION {
            return Err(TrainerError::Serialization(format!(
                "{} has manifest format {}, expected {}",
                path.display(),
                self.format_version,
                MANIFEST_FORMAT_VERSION
            )));
        }
        let classes = self.classes();
        let consistent = classes.len() == self.classifier.num_classes
            && classes
                .iter()
                .all(|(name, idx)| self.class_indices.get(name) == Some(&idx));
        if !consistent {
            return Err(TrainerError::IncompatibleShape(format!(
                "{} lists {} classes for a {}-way classifier",
                path.display(),
                self.class_indices.len(),
                self.classifier.num_classes
            )));
        }
        Ok(())
    }
}

/// Files written for one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub weights: PathBuf,
    pub manifest: PathBuf,
}

impl ArtifactPaths {
    /// Derive both file names from a base path; a trailing `.mpk` or
    /// `.json` on the base is ignored.
    pub fn from_base<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        let stem = match base.extension().and_then(|e| e.to_str()) {
            Some(WEIGHTS_EXTENSION) | Some(MANIFEST_EXTENSION) => base.with_extension(""),
            _ => base.to_path_buf(),
        };
        Self {
            weights: append_extension(&stem, WEIGHTS_EXTENSION),
            manifest: append_extension(&stem, MANIFEST_EXTENSION),
        }
    }
}

fn append_extension(stem: &Path, extension: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Saves and restores trained classifiers
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    paths: ArtifactPaths,
}

impl ArtifactWriter {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            paths: ArtifactPaths::from_base(base),
        }
    }

    /// Write the weights record and the manifest, replacing earlier files.
    /// Saving the same model and manifest again produces identical files.
    pub fn save<B: Backend>(
        &self,
        model: &Classifier<B>,
        manifest: &ArtifactManifest,
    ) -> Result<ArtifactPaths> {
        let ArtifactPaths { weights, manifest: manifest_path } = &self.paths;

        if let Some(parent) = weights.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| TrainerError::write(parent, e))?;
        }

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        model
            .clone()
            .save_file(weights.clone(), &recorder)
            .map_err(|e| TrainerError::write(weights, e))?;

        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(manifest_path, json).map_err(|e| TrainerError::write(manifest_path, e))?;

        info!(
            "Saved model to {} (manifest {})",
            weights.display(),
            manifest_path.display()
        );
        Ok(self.paths.clone())
    }

    pub fn load_manifest(&self) -> Result<ArtifactManifest> {
        let path = &self.paths.manifest;
        let json = fs::read_to_string(path).map_err(|e| {
            TrainerError::Weights(format!("cannot read manifest {}: {}", path.display(), e))
        })?;
        let manifest: ArtifactManifest = serde_json::from_str(&json)?;
        manifest.check(path)?;
        Ok(manifest)
    }

    /// Rebuild the classifier described by the manifest and fill in the record
    pub fn load<B: Backend>(&self, device: &B::Device) -> Result<(Classifier<B>, ArtifactManifest)> {
        let manifest = self.load_manifest()?;
        let template = manifest.classifier.init::<B>(device)?;
        let expected = ParameterSnapshot::shapes_of(&template);

        let weights = &self.paths.weights;
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let model = template
            .load_file(weights.clone(), &recorder, device)
            .map_err(|e| match e {
                RecorderError::FileNotFound(_) => TrainerError::Weights(format!(
                    "model weights not found at {}",
                    weights.display()
                )),
                other => TrainerError::IncompatibleShape(format!(
                    "{} does not match its manifest: {}",
                    weights.display(),
                    other
                )),
            })?;

        if ParameterSnapshot::shapes_of(&model) != expected {
            return Err(TrainerError::IncompatibleShape(format!(
                "{} does not match the structure in {}",
                weights.display(),
                self.paths.manifest.display()
            )));
        }

        info!("Loaded model from {}", weights.display());
        Ok((model, manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SeededWeights;
    use crate::training::EpochMetrics;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn classes() -> ClassIndex {
        ClassIndex::new(["rust", "healthy", "blight"])
    }

    fn fixture() -> (Classifier<TestBackend>, ArtifactManifest) {
        let config =
            ClassifierConfig::new(3, ImageSize::new(32, 32)).with_width_multiplier(0.35);
        let model = config
            .assemble::<TestBackend, _>(&SeededWeights { seed: 11 }, &Default::default())
            .unwrap();

        let mut history = TrainingHistory::new();
        history.push(EpochMetrics {
            epoch: 1,
            loss: 1.1,
            accuracy: 0.4,
            val_loss: 1.0,
            val_accuracy: 0.5,
            duration_secs: 0.3,
            skipped_images: 0,
        });
        let manifest = ArtifactManifest::new(config, &classes(), 1.0 / 255.0, history);
        (model, manifest)
    }

    #[test]
    fn test_paths_from_base() {
        let paths = ArtifactPaths::from_base("out/crop_disease_mobilenetv2");
        assert_eq!(paths.weights, PathBuf::from("out/crop_disease_mobilenetv2.mpk"));
        assert_eq!(paths.manifest, PathBuf::from("out/crop_disease_mobilenetv2.json"));

        assert_eq!(ArtifactPaths::from_base("model.mpk"), ArtifactPaths::from_base("model"));
        assert_eq!(
            ArtifactPaths::from_base("model.v2").weights,
            PathBuf::from("model.v2.mpk")
        );
    }

    #[test]
    fn test_save_then_load_reproduces_predictions() {
        let tmp = TempDir::new().unwrap();
        let (model, manifest) = fixture();
        let writer = ArtifactWriter::new(tmp.path().join("models").join("crop"));
        let paths = writer.save(&model, &manifest).unwrap();
        assert!(paths.weights.exists());
        assert!(paths.manifest.exists());

        let device = Default::default();
        let (restored, restored_manifest) = writer.load::<TestBackend>(&device).unwrap();
        assert_eq!(restored_manifest, manifest);
        assert_eq!(restored_manifest.classes(), classes());

        let images = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device).mul_scalar(0.3);
        let a: Vec<f32> = model.forward(images.clone()).into_data().to_vec().unwrap();
        let b: Vec<f32> = restored.forward(images).into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_saving_twice_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (model, manifest) = fixture();
        let writer = ArtifactWriter::new(tmp.path().join("crop"));

        let paths = writer.save(&model, &manifest).unwrap();
        let weights_first = fs::read(&paths.weights).unwrap();
        let manifest_first = fs::read(&paths.manifest).unwrap();

        writer.save(&model, &manifest).unwrap();
        assert_eq!(fs::read(&paths.weights).unwrap(), weights_first);
        assert_eq!(fs::read(&paths.manifest).unwrap(), manifest_first);
    }

    #[test]
    fn test_unwritable_destination_is_a_write_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not_a_dir");
        fs::write(&blocker, b"occupied").unwrap();

        let (model, manifest) = fixture();
        let writer = ArtifactWriter::new(blocker.join("crop"));
        let result = writer.save(&model, &manifest);
        assert!(matches!(result, Err(TrainerError::Write { .. })));
    }

    #[test]
    fn test_load_without_artifact() {
        let tmp = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(tmp.path().join("missing"));
        let result = writer.load::<TestBackend>(&Default::default());
        assert!(matches!(result, Err(TrainerError::Weights(_))));
    }

    #[test]
    fn test_inconsistent_manifest_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (model, mut manifest) = fixture();
        manifest.class_indices.remove("rust");
        let writer = ArtifactWriter::new(tmp.path().join("crop"));
        writer.save(&model, &manifest).unwrap();

        let result = writer.load_manifest();
        assert!(matches!(result, Err(TrainerError::IncompatibleShape(_))));
    }
}
