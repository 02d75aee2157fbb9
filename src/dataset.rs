//! Raw image/label datasets and minibatch sampling
//!
//! Partitions wrap the byte buffers of an IDX-style file pair: an image file
//! with a fixed-size header followed by `image_size²` unsigned bytes per
//! record, and a label file with its own header followed by one byte per
//! record.

use crate::error::{EngineError, Result};
use crate::tensor::{one_hot, ImageBatch, ImageShape, TensorImage};
use crate::utils::SimpleRng;
use serde::{Deserialize, Serialize};

/// Header sizes and image extent of a dataset file pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetLayout {
    pub image_size: usize,
    pub image_metadata_size: usize,
    pub label_metadata_size: usize,
}

impl DatasetLayout {
    /// MNIST IDX files: 28×28 images, 16-byte image header, 8-byte label header.
    pub fn mnist() -> Self {
        Self {
            image_size: 28,
            image_metadata_size: 16,
            label_metadata_size: 8,
        }
    }

    /// Bytes per image record, `image_size²`.
    pub fn image_bytes(&self) -> Result<usize> {
        self.image_size
            .checked_mul(self.image_size)
            .ok_or_else(|| EngineError::config(format!("image size {} overflows", self.image_size)))
    }

    pub fn image_shape(&self) -> ImageShape {
        ImageShape::new(self.image_size, self.image_size, 1)
    }
}

impl Default for DatasetLayout {
    fn default() -> Self {
        Self::mnist()
    }
}

/// One split (train or test) of a dataset.
#[derive(Debug, Clone)]
pub struct Partition {
    images: Vec<u8>,
    labels: Vec<u8>,
    layout: DatasetLayout,
    record_count: usize,
}

impl Partition {
    pub fn new(images: Vec<u8>, labels: Vec<u8>, layout: DatasetLayout) -> Result<Self> {
        if layout.image_size == 0 {
            return Err(EngineError::config("image size must be positive"));
        }
        let record_count = labels
            .len()
            .checked_sub(layout.label_metadata_size)
            .ok_or_else(|| {
                EngineError::config(format!(
                    "label buffer of {} bytes is shorter than its {}-byte header",
                    labels.len(),
                    layout.label_metadata_size
                ))
            })?;

        let needed = record_count
            .checked_mul(layout.image_bytes()?)
            .and_then(|bytes| bytes.checked_add(layout.image_metadata_size))
            .ok_or_else(|| {
                EngineError::config(format!(
                    "{} records of {}x{} images overflow the addressable size",
                    record_count, layout.image_size, layout.image_size
                ))
            })?;
        if images.len() < needed {
            return Err(EngineError::config(format!(
                "{} labels need {} image bytes, buffer holds {}",
                record_count,
                needed,
                images.len()
            )));
        }

        Ok(Self {
            images,
            labels,
            layout,
            record_count,
        })
    }

    pub fn len(&self) -> usize {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.record_count {
            return Err(EngineError::DataBounds(format!(
                "record {} outside [0, {})",
                index, self.record_count
            )));
        }
        Ok(())
    }

    /// Raw pixels of record `index`.
    pub fn image_bytes(&self, index: usize) -> Result<&[u8]> {
        self.check_index(index)?;
        let size = self.layout.image_bytes()?;
        let start = self.layout.image_metadata_size + index * size;
        Ok(&self.images[start..start + size])
    }

    pub fn label(&self, index: usize) -> Result<u8> {
        self.check_index(index)?;
        Ok(self.labels[self.layout.label_metadata_size + index])
    }

    /// Record `index` as a normalized single-channel image.
    pub fn image(&self, index: usize) -> Result<TensorImage> {
        let size = self.layout.image_size;
        TensorImage::from_unorm8(size, size, self.image_bytes(index)?)
    }
}

/// Train and test partitions sharing one layout.
#[derive(Debug, Clone)]
pub struct Dataset {
    train: Partition,
    test: Partition,
    layout: DatasetLayout,
}

impl Dataset {
    pub fn new(
        train_images: Vec<u8>,
        train_labels: Vec<u8>,
        test_images: Vec<u8>,
        test_labels: Vec<u8>,
        layout: DatasetLayout,
    ) -> Result<Self> {
        Ok(Self {
            train: Partition::new(train_images, train_labels, layout)?,
            test: Partition::new(test_images, test_labels, layout)?,
            layout,
        })
    }

    pub fn train(&self) -> &Partition {
        &self.train
    }

    pub fn test(&self) -> &Partition {
        &self.test
    }

    pub fn layout(&self) -> DatasetLayout {
        self.layout
    }

    pub fn image_shape(&self) -> ImageShape {
        self.layout.image_shape()
    }
}

/// Builds minibatches of images with one-hot targets.
#[derive(Debug, Clone)]
pub struct DatasetSampler {
    class_count: usize,
    rng: SimpleRng,
    cursor: usize,
}

impl DatasetSampler {
    pub fn new(class_count: usize, seed: u64) -> Self {
        Self {
            class_count,
            rng: SimpleRng::new(seed),
            cursor: 0,
        }
    }

    pub fn class_count(&self) -> usize {
        self.class_count
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    /// Independent RNG stream for a command unit.
    pub fn fork_rng(&mut self, salt: u64) -> SimpleRng {
        self.rng.fork(salt)
    }

    fn push_record(&self, batch: &mut ImageBatch, partition: &Partition, index: usize) -> Result<()> {
        let label = partition.label(index)?;
        let target = one_hot(label, self.class_count)?;
        batch.push(partition.image(index)?, target, label)
    }

    /// `n` training records drawn uniformly with replacement.
    pub fn sample_random_batch(&mut self, dataset: &Dataset, n: usize) -> Result<ImageBatch> {
        let partition = dataset.train();
        if n == 0 {
            return Err(EngineError::config("batch size must be positive"));
        }
        if partition.is_empty() {
            return Err(EngineError::config("training partition has no records"));
        }

        let mut batch = ImageBatch::with_capacity(n);
        for _ in 0..n {
            let index = self.rng.gen_usize(partition.len());
            self.push_record(&mut batch, partition, index)?;
        }
        Ok(batch)
    }

    /// Up to `n` test records starting at `start`, in order. The cursor moves
    /// past the covered range.
    ///
    /// A record whose label is outside `[0, class_count)` is left out of the
    /// batch with a warning; the rest of the range is still returned.
    pub fn sequential_batch(&mut self, dataset: &Dataset, start: usize, n: usize) -> Result<ImageBatch> {
        let partition = dataset.test();
        if n == 0 {
            return Err(EngineError::config("batch size must be positive"));
        }
        if start > partition.len() {
            return Err(EngineError::DataBounds(format!(
                "start {} past the {} test records",
                start,
                partition.len()
            )));
        }

        let end = start.saturating_add(n).min(partition.len());
        let mut batch = ImageBatch::with_capacity(end - start);
        for index in start..end {
            match self.push_record(&mut batch, partition, index) {
                Ok(()) => {}
                Err(EngineError::DataBounds(reason)) => {
                    log::warn!("Skipping test record {}: {}", index, reason);
                }
                Err(err) => return Err(err),
            }
        }
        self.cursor = end;
        Ok(batch)
    }

    pub fn next_sequential_batch(&mut self, dataset: &Dataset, n: usize) -> Result<ImageBatch> {
        self.sequential_batch(dataset, self.cursor, n)
    }
}
