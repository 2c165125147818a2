//! Dataset Locator
//!
//! Resolves a split root (`train/` or `validation/`), discovers the class
//! labels from its immediate subdirectories and enumerates the image files
//! of every class.
//!
//! ```text
//! root/
//! ├── Corn___Common_rust/
//! │   ├── image1.jpg
//! │   └── image2.jpg
//! ├── Corn___healthy/
//! │   └── ...
//! └── ...
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::utils::error::{Result, TrainerError};
use crate::utils::format_class_indices;

/// File extensions recognised as images (case-insensitive)
pub const DEFAULT_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "webp"];

/// The fixed, alphabetically ordered set of class labels of a split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassIndex {
    names: Vec<String>,
}

impl ClassIndex {
    /// Build from class names; order is normalised to sorted, duplicates removed
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self { names }
    }

    /// Number of classes
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).ok()
    }

    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// `(name, index)` pairs in index order
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.names.iter().enumerate().map(|(i, n)| (n.as_str(), i))
    }

    /// Name to index mapping
    pub fn to_map(&self) -> BTreeMap<String, usize> {
        self.iter().map(|(n, i)| (n.to_string(), i)).collect()
    }

    /// Fail unless `other` has exactly the same classes in the same order.
    ///
    /// A mismatch would silently mis-index labels between splits.
    pub fn ensure_matches(&self, other: &ClassIndex) -> Result<()> {
        if self == other {
            return Ok(());
        }

        let missing: Vec<&str> = self
            .names
            .iter()
            .filter(|n| other.index_of(n).is_none())
            .map(String::as_str)
            .collect();
        let extra: Vec<&str> = other
            .names
            .iter()
            .filter(|n| self.index_of(n).is_none())
            .map(String::as_str)
            .collect();

        Err(TrainerError::IncompatibleShape(format!(
            "validation classes differ from training classes ({} vs {}); missing in validation: {:?}, unknown to training: {:?}",
            self.len(),
            other.len(),
            missing,
            extra
        )))
    }
}

impl fmt::Display for ClassIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_class_indices(self.iter()))
    }
}

/// A single image on disk with the class inferred from its directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Path to the image file
    pub path: PathBuf,
    /// Class label index
    pub label: usize,
    /// Class name (the directory name)
    pub class_name: String,
}

/// A scanned split: its class index plus every image record, in
/// class-then-filename order
#[derive(Debug, Clone)]
pub struct ImageFolder {
    /// Root directory of the split
    pub root: PathBuf,
    /// Sorted class labels
    pub classes: ClassIndex,
    /// All image records
    pub records: Vec<ImageRecord>,
}

impl ImageFolder {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Get statistics about the split
    pub fn stats(&self) -> DatasetStats {
        let mut class_counts = vec![0usize; self.num_classes()];
        for record in &self.records {
            class_counts[record.label] += 1;
        }

        DatasetStats {
            total_samples: self.records.len(),
            class_names: self.classes.names().to_vec(),
            class_counts,
        }
    }
}

impl Dataset<ImageRecord> for ImageFolder {
    fn get(&self, index: usize) -> Option<ImageRecord> {
        self.records.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Scans directory-structured datasets
#[derive(Debug, Clone)]
pub struct DatasetLocator {
    /// Lower-cased file extensions accepted as images
    extensions: Vec<String>,
}

impl Default for DatasetLocator {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS)
    }
}

impl DatasetLocator {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
            .collect();
        Self { extensions }
    }

    fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.extensions.iter().any(|e| *e == ext))
    }

    /// Discover the class labels of a split root.
    ///
    /// Fails with `DatasetNotFound` when the root does not exist, is not a
    /// directory, or has no subdirectories.
    pub fn discover_classes(&self, root: &Path) -> Result<ClassIndex> {
        if !root.exists() {
            return Err(TrainerError::dataset_not_found(root, "directory does not exist"));
        }
        if !root.is_dir() {
            return Err(TrainerError::dataset_not_found(root, "path is not a directory"));
        }

        let mut class_dirs: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if entry.path().is_dir() {
                class_dirs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        if class_dirs.is_empty() {
            return Err(TrainerError::dataset_not_found(
                root,
                "no class subdirectories found",
            ));
        }

        Ok(ClassIndex::new(class_dirs))
    }

    /// Scan a split root into an [`ImageFolder`].
    ///
    /// Every class directory is walked recursively; files are kept when
    /// their extension is recognised, in sorted order. A split without a
    /// single image is reported as `DatasetNotFound`.
    pub fn locate<P: AsRef<Path>>(&self, root: P) -> Result<ImageFolder> {
        let root = root.as_ref().to_path_buf();
        info!("Scanning dataset split: {:?}", root);

        let classes = self.discover_classes(&root)?;
        info!("Found {} classes", classes.len());

        let mut records = Vec::new();
        for (class_name, label) in classes.iter() {
            let class_dir = root.join(class_name);
            let before = records.len();

            for entry in WalkDir::new(&class_dir)
                .follow_links(true)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file() && self.is_image(entry.path()) {
                    records.push(ImageRecord {
                        path: entry.path().to_path_buf(),
                        label,
                        class_name: class_name.to_string(),
                    });
                }
            }

            let count = records.len() - before;
            if count == 0 {
                warn!("Class '{}' has no images in {:?}", class_name, class_dir);
            }
            debug!("Class '{}' (label {}): {} images", class_name, label, count);
        }

        if records.is_empty() {
            return Err(TrainerError::dataset_not_found(
                &root,
                format!("no image files found in {} class directories", classes.len()),
            ));
        }

        info!("Found {} images belonging to {} classes", records.len(), classes.len());

        Ok(ImageFolder {
            root,
            classes,
            records,
        })
    }
}

/// Statistics about a scanned split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_samples: usize,
    pub class_names: Vec<String>,
    pub class_counts: Vec<usize>,
}

impl DatasetStats {
    /// Print statistics to console
    pub fn print(&self, title: &str) {
        println!("\n📊 {}", title.cyan().bold());
        println!("  Total samples: {}", self.total_samples);
        println!("  Number of classes: {}", self.class_names.len());
        println!("\n  Samples per class:");

        for (idx, (name, count)) in self.class_names.iter().zip(&self.class_counts).enumerate() {
            let bar_len = if self.total_samples == 0 {
                0
            } else {
                (*count as f32 / self.total_samples as f32 * 40.0) as usize
            };
            println!("    {:3}. {:40} {:5} {}", idx, name, count, "█".repeat(bar_len));
        }
    }
}
