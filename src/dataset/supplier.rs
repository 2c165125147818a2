//! Batch Supplier
//!
//! Turns a scanned [`ImageFolder`] into a lazy sequence of tensor batches.
//! One call to [`BatchSupplier::epoch`] is one pass over every record
//! (reshuffled first when shuffling is on); [`BatchSupplier::into_stream`]
//! cycles over epochs forever.
//!
//! Images are decoded only when their batch is requested. Decoding and
//! augmentation of one batch run in parallel; each item gets its own RNG
//! seeded from the supplier's RNG, so a seed fully determines the stream.

use std::path::PathBuf;

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use image::{DynamicImage, ImageReader};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dataset::augmentation::Augmenter;
use crate::dataset::locator::{ClassIndex, ImageFolder, ImageRecord};
use crate::dataset::ImageSize;
use crate::utils::error::{Result, TrainerError};

/// What to do with an image file that cannot be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorruptImagePolicy {
    /// Log a warning, leave the image out of its batch and continue
    #[default]
    Skip,
    /// Abort with a `CorruptImage` error
    Fail,
}

/// A decoded, preprocessed image ready for batching
#[derive(Clone, Debug)]
pub struct ImageItem {
    /// Image data as flattened CHW float array [3 * H * W]
    pub pixels: Vec<f32>,
    /// Class label index
    pub label: usize,
    /// Source file (for logging)
    pub path: PathBuf,
}

/// A batch of images with one-hot labels
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// Images with shape [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// One-hot labels with shape [batch_size, num_classes]
    pub labels: Tensor<B, 2>,
    /// Class indices with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Burn batcher stacking [`ImageItem`]s into an [`ImageBatch`]
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    image_size: ImageSize,
    num_classes: usize,
}

impl ImageBatcher {
    pub fn new(image_size: ImageSize, num_classes: usize) -> Self {
        Self {
            image_size,
            num_classes,
        }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let (height, width) = (
            self.image_size.height as usize,
            self.image_size.width as usize,
        );

        let mut one_hot = vec![0.0f32; batch_size * self.num_classes];
        for (row, item) in items.iter().enumerate() {
            one_hot[row * self.num_classes + item.label] = 1.0;
        }
        let targets_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let mut images_data = Vec::with_capacity(batch_size * self.image_size.num_values());
        for item in items {
            images_data.extend(item.pixels);
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, 3, height, width]),
            device,
        );
        let labels = Tensor::<B, 2>::from_floats(
            TensorData::new(one_hot, [batch_size, self.num_classes]),
            device,
        );
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        ImageBatch {
            images,
            labels,
            targets,
        }
    }
}

/// Batching policy of one supplier
#[derive(Debug, Clone)]
pub struct SupplierConfig {
    pub batch_size: usize,
    /// Reshuffle the record order at the start of every epoch
    pub shuffle: bool,
    /// Apply random augmentation (training only)
    pub augment: bool,
    pub corrupt_images: CorruptImagePolicy,
    pub seed: u64,
}

impl SupplierConfig {
    /// Shuffled, augmented batches
    pub fn training(batch_size: usize, corrupt_images: CorruptImagePolicy, seed: u64) -> Self {
        Self {
            batch_size,
            shuffle: true,
            augment: true,
            corrupt_images,
            seed,
        }
    }

    /// Directory-ordered, rescale-only batches
    pub fn validation(batch_size: usize, corrupt_images: CorruptImagePolicy) -> Self {
        Self {
            batch_size,
            shuffle: false,
            augment: false,
            corrupt_images,
            seed: 0,
        }
    }
}

/// Position inside the current epoch
#[derive(Debug, Default)]
struct Cursor {
    order: Vec<usize>,
    position: usize,
    skipped: usize,
    failed: bool,
}

/// Lazy, restartable producer of [`ImageBatch`]es from one split
pub struct BatchSupplier<B: Backend> {
    folder: ImageFolder,
    augmenter: Augmenter,
    batcher: ImageBatcher,
    config: SupplierConfig,
    rng: ChaCha8Rng,
    device: B::Device,
    cursor: Cursor,
    epochs_started: usize,
}

impl<B: Backend> std::fmt::Debug for BatchSupplier<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSupplier")
            .field("root", &self.folder.root)
            .field("samples", &self.folder.records.len())
            .field("batch_size", &self.config.batch_size)
            .field("shuffle", &self.config.shuffle)
            .field("augment", &self.config.augment)
            .finish()
    }
}

impl<B: Backend> BatchSupplier<B> {
    /// Create a supplier over `folder`; labels are one-hot encoded against
    /// `folder.classes`, fixed from here on.
    pub fn new(
        folder: ImageFolder,
        augmenter: Augmenter,
        config: SupplierConfig,
        device: B::Device,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(TrainerError::Config("batch_size must be at least 1".into()));
        }

        let batcher = ImageBatcher::new(augmenter.image_size(), folder.num_classes());
        let rng = ChaCha8Rng::seed_from_u64(config.seed);

        Ok(Self {
            folder,
            augmenter,
            batcher,
            config,
            rng,
            device,
            cursor: Cursor::default(),
            epochs_started: 0,
        })
    }

    pub fn classes(&self) -> &ClassIndex {
        &self.folder.classes
    }

    pub fn num_classes(&self) -> usize {
        self.folder.num_classes()
    }

    pub fn num_samples(&self) -> usize {
        self.folder.records.len()
    }

    /// Number of batches in one full epoch (the last one may be partial)
    pub fn batches_per_epoch(&self) -> usize {
        self.num_samples().div_ceil(self.config.batch_size)
    }

    pub fn epochs_started(&self) -> usize {
        self.epochs_started
    }

    pub fn folder(&self) -> &ImageFolder {
        &self.folder
    }

    /// Begin a new pass over every record and return it as an iterator
    pub fn epoch(&mut self) -> Epoch<'_, B> {
        self.start_epoch();
        Epoch { supplier: self }
    }

    /// Endless batch stream, reshuffling at every epoch boundary
    pub fn into_stream(self) -> BatchStream<B> {
        BatchStream {
            supplier: self,
            yielded_this_epoch: 0,
        }
    }

    fn start_epoch(&mut self) {
        let mut order: Vec<usize> = (0..self.folder.records.len()).collect();
        if self.config.shuffle {
            order.shuffle(&mut self.rng);
        }
        self.cursor = Cursor {
            order,
            ..Cursor::default()
        };
        self.epochs_started += 1;
        debug!(
            "Epoch {} of {:?}: {} batches",
            self.epochs_started,
            self.folder.root,
            self.batches_per_epoch()
        );
    }

    /// Produce the next batch of the current epoch, `None` once exhausted
    fn next_batch(&mut self) -> Option<Result<ImageBatch<B>>> {
        loop {
            if self.cursor.failed || self.cursor.position >= self.cursor.order.len() {
                return None;
            }

            let start = self.cursor.position;
            let end = (start + self.config.batch_size).min(self.cursor.order.len());
            self.cursor.position = end;

            let jobs: Vec<(&ImageRecord, Option<u64>)> = self.cursor.order[start..end]
                .iter()
                .map(|&i| {
                    let seed = self.config.augment.then(|| self.rng.gen::<u64>());
                    (&self.folder.records[i], seed)
                })
                .collect();

            let augmenter = &self.augmenter;
            let loaded: Vec<Result<ImageItem>> = jobs
                .par_iter()
                .map(|(record, seed)| load_item(augmenter, record, *seed))
                .collect();

            let mut items = Vec::with_capacity(loaded.len());
            for result in loaded {
                match result {
                    Ok(item) => {
                        debug!("Loaded {} (class {})", item.path.display(), item.label);
                        items.push(item);
                    }
                    Err(err) => match self.config.corrupt_images {
                        CorruptImagePolicy::Skip => {
                            warn!("Skipping unreadable image: {}", err);
                            self.cursor.skipped += 1;
                        }
                        CorruptImagePolicy::Fail => {
                            self.cursor.failed = true;
                            return Some(Err(err));
                        }
                    },
                }
            }

            if items.is_empty() {
                continue;
            }

            return Some(Ok(<ImageBatcher as Batcher<B, ImageItem, ImageBatch<B>>>::batch(
                &self.batcher,
                items,
                &self.device,
            )));
        }
    }
}

/// Decode one record and run it through the augmenter
fn load_item(augmenter: &Augmenter, record: &ImageRecord, seed: Option<u64>) -> Result<ImageItem> {
    let img = decode(record)?;
    let pixels = match seed {
        Some(seed) => {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            augmenter.preprocess(&img, Some(&mut rng))
        }
        None => augmenter.preprocess(&img, None),
    };

    Ok(ImageItem {
        pixels,
        label: record.label,
        path: record.path.clone(),
    })
}

fn decode(record: &ImageRecord) -> Result<DynamicImage> {
    ImageReader::open(&record.path)
        .map_err(|e| TrainerError::corrupt_image(&record.path, e))?
        .with_guessed_format()
        .map_err(|e| TrainerError::corrupt_image(&record.path, e))?
        .decode()
        .map_err(|e| TrainerError::corrupt_image(&record.path, e))
}

/// One pass over a supplier's records
pub struct Epoch<'a, B: Backend> {
    supplier: &'a mut BatchSupplier<B>,
}

impl<B: Backend> Epoch<'_, B> {
    /// Images skipped so far in this epoch under the skip policy
    pub fn skipped(&self) -> usize {
        self.supplier.cursor.skipped
    }

    /// Number of batches this epoch yields when no image is skipped
    pub fn expected_batches(&self) -> usize {
        self.supplier.batches_per_epoch()
    }
}

impl<B: Backend> Iterator for Epoch<'_, B> {
    type Item = Result<ImageBatch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.supplier.next_batch()
    }
}

/// Endless cyclic stream over epochs
pub struct BatchStream<B: Backend> {
    supplier: BatchSupplier<B>,
    yielded_this_epoch: usize,
}

impl<B: Backend> BatchStream<B> {
    pub fn supplier(&self) -> &BatchSupplier<B> {
        &self.supplier
    }
}

impl<B: Backend> Iterator for BatchStream<B> {
    type Item = Result<ImageBatch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.supplier.epochs_started == 0 {
            self.supplier.start_epoch();
        }
        loop {
            match self.supplier.next_batch() {
                Some(batch) => {
                    self.yielded_this_epoch += 1;
                    return Some(batch);
                }
                None if self.supplier.cursor.failed => return None,
                // A whole epoch without a single readable image would spin forever
                None if self.yielded_this_epoch == 0 => return None,
                None => {
                    self.yielded_this_epoch = 0;
                    self.supplier.start_epoch();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::augmentation::AugmentationConfig;
    use crate::dataset::locator::DatasetLocator;
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Rgb};
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    const SIZE: ImageSize = ImageSize {
        height: 16,
        width: 16,
    };

    fn write_image(path: &Path, shade: u8) {
        let img = ImageBuffer::from_fn(20, 12, |x, _| Rgb([shade, (x * 10) as u8, 255 - shade]));
        img.save(path).unwrap();
    }

    fn make_split(root: &Path, classes: &[&str], per_class: usize) {
        for (c, class) in classes.iter().enumerate() {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                write_image(&dir.join(format!("{}_{:02}.png", class, i)), (c * 60 + i) as u8);
            }
        }
    }

    fn supplier(root: &Path, config: SupplierConfig) -> BatchSupplier<TestBackend> {
        let folder = DatasetLocator::default().locate(root).unwrap();
        let augmenter = if config.augment {
            Augmenter::new(AugmentationConfig::default(), SIZE)
        } else {
            Augmenter::validation(1.0 / 255.0, SIZE)
        };
        BatchSupplier::new(folder, augmenter, config, Default::default()).unwrap()
    }

    #[test]
    fn test_batches_cover_every_record_once() {
        let tmp = TempDir::new().unwrap();
        make_split(tmp.path(), &["a", "b", "c"], 10);
        let mut s = supplier(
            tmp.path(),
            SupplierConfig::training(5, CorruptImagePolicy::Skip, 42),
        );

        assert_eq!(s.batches_per_epoch(), 6);
        let batches: Vec<_> = s.epoch().map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 6);
        assert!(batches.iter().all(|b| b.len() == 5));

        let mut per_class = [0usize; 3];
        for b in &batches {
            let targets: Vec<i64> = b.targets.clone().into_data().iter::<i64>().collect();
            for t in targets {
                per_class[t as usize] += 1;
            }
        }
        assert_eq!(per_class, [10, 10, 10]);
    }

    #[test]
    fn test_one_hot_labels_sum_to_one() {
        let tmp = TempDir::new().unwrap();
        make_split(tmp.path(), &["a", "b", "c"], 4);
        let mut s = supplier(
            tmp.path(),
            SupplierConfig::training(5, CorruptImagePolicy::Skip, 1),
        );

        for batch in s.epoch() {
            let batch = batch.unwrap();
            let [rows, width] = batch.labels.dims();
            assert_eq!(width, 3);

            let labels: Vec<f32> = batch.labels.clone().into_data().to_vec().unwrap();
            let targets: Vec<i64> = batch.targets.clone().into_data().iter::<i64>().collect();
            for r in 0..rows {
                let row = &labels[r * width..(r + 1) * width];
                assert_eq!(row.iter().sum::<f32>(), 1.0);
                assert_eq!(row[targets[r] as usize], 1.0);
            }
        }
    }

    #[test]
    fn test_final_batch_may_be_partial() {
        let tmp = TempDir::new().unwrap();
        make_split(tmp.path(), &["a", "b"], 3);
        let mut s = supplier(tmp.path(), SupplierConfig::validation(4, CorruptImagePolicy::Skip));

        let sizes: Vec<usize> = s.epoch().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 2]);
    }

    #[test]
    fn test_validation_batches_are_in_directory_order_and_repeatable() {
        let tmp = TempDir::new().unwrap();
        make_split(tmp.path(), &["a", "b"], 3);
        let mut s = supplier(tmp.path(), SupplierConfig::validation(6, CorruptImagePolicy::Skip));

        let first = s.epoch().next().unwrap().unwrap();
        let second = s.epoch().next().unwrap().unwrap();

        let targets: Vec<i64> = first.targets.clone().into_data().iter::<i64>().collect();
        assert_eq!(targets, vec![0, 0, 0, 1, 1, 1]);

        let a: Vec<f32> = first.images.into_data().to_vec().unwrap();
        let b: Vec<f32> = second.images.into_data().to_vec().unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(s.epochs_started(), 2);
    }

    #[test]
    fn test_shuffle_changes_order_between_epochs() {
        let tmp = TempDir::new().unwrap();
        make_split(tmp.path(), &["a", "b", "c"], 10);
        let mut config = SupplierConfig::training(30, CorruptImagePolicy::Skip, 9);
        config.augment = false;
        let mut s = supplier(tmp.path(), config);

        let first: Vec<i64> = s.epoch().next().unwrap().unwrap().targets.into_data().iter::<i64>().collect();
        let second: Vec<i64> = s.epoch().next().unwrap().unwrap().targets.into_data().iter::<i64>().collect();

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, [vec![0; 10], vec![1; 10], vec![2; 10]].concat());
        assert_ne!(first, second);
    }

    #[test]
    fn test_same_seed_gives_same_stream() {
        let tmp = TempDir::new().unwrap();
        make_split(tmp.path(), &["a", "b"], 4);
        let config = SupplierConfig::training(8, CorruptImagePolicy::Skip, 5);

        let mut s1 = supplier(tmp.path(), config.clone());
        let mut s2 = supplier(tmp.path(), config);

        let a: Vec<f32> = s1.epoch().next().unwrap().unwrap().images.into_data().to_vec().unwrap();
        let b: Vec<f32> = s2.epoch().next().unwrap().unwrap().images.into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_corrupt_image_is_skipped() {
        let tmp = TempDir::new().unwrap();
        make_split(tmp.path(), &["a", "b"], 2);
        std::fs::write(tmp.path().join("a").join("broken.png"), b"not an image").unwrap();
        let mut s = supplier(tmp.path(), SupplierConfig::validation(5, CorruptImagePolicy::Skip));

        let mut epoch = s.epoch();
        let sizes: Vec<usize> = epoch.by_ref().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![4]);
        assert_eq!(epoch.skipped(), 1);
    }

    #[test]
    fn test_corrupt_image_fails_under_fail_policy() {
        let tmp = TempDir::new().unwrap();
        make_split(tmp.path(), &["a"], 2);
        std::fs::write(tmp.path().join("a").join("broken.png"), b"not an image").unwrap();
        let mut s = supplier(tmp.path(), SupplierConfig::validation(2, CorruptImagePolicy::Fail));

        let results: Vec<_> = s.epoch().collect();
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(TrainerError::CorruptImage { .. }))));
        assert!(matches!(results.last(), Some(Err(_))));
    }

    #[test]
    fn test_stream_cycles_over_epochs() {
        let tmp = TempDir::new().unwrap();
        make_split(tmp.path(), &["a", "b"], 2);
        let s = supplier(tmp.path(), SupplierConfig::validation(3, CorruptImagePolicy::Skip));

        let mut stream = s.into_stream();
        let sizes: Vec<usize> = stream.by_ref().take(5).map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![3, 1, 3, 1, 3]);
        assert_eq!(stream.supplier().epochs_started(), 3);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let tmp = TempDir::new().unwrap();
        make_split(tmp.path(), &["a"], 1);
        let folder = DatasetLocator::default().locate(tmp.path()).unwrap();
        let result = BatchSupplier::<TestBackend>::new(
            folder,
            Augmenter::validation(1.0 / 255.0, SIZE),
            SupplierConfig::validation(0, CorruptImagePolicy::Skip),
            Default::default(),
        );
        assert!(matches!(result, Err(TrainerError::Config(_))));
    }
}
