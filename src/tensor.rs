//! Device-resident image tensors and minibatches
//!
//! Images are stored channel-major (`channels × height × width`, row-major
//! inside each channel), the layout every graph node expects.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Spatial extent and channel count of one feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl ImageShape {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// A 1×1 feature vector of `channels` entries.
    pub fn vector(channels: usize) -> Self {
        Self::new(1, 1, channels)
    }

    pub fn spatial(&self) -> usize {
        self.width * self.height
    }

    pub fn element_count(&self) -> usize {
        self.width * self.height * self.channels
    }

    pub fn is_vector(&self) -> bool {
        self.width == 1 && self.height == 1
    }
}

impl fmt::Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

/// One feature map.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorImage {
    shape: ImageShape,
    data: Vec<f32>,
}

impl TensorImage {
    pub fn new(shape: ImageShape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.element_count() {
            return Err(EngineError::config(format!(
                "image of shape {} needs {} values, got {}",
                shape,
                shape.element_count(),
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: ImageShape) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.element_count()],
        }
    }

    /// Build a single-channel image from unsigned 8-bit pixels, normalized to [0, 1].
    pub fn from_unorm8(width: usize, height: usize, pixels: &[u8]) -> Result<Self> {
        let data = pixels.iter().map(|&p| p as f32 / 255.0).collect();
        Self::new(ImageShape::new(width, height, 1), data)
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// A minibatch: images paired index-by-index with one-hot targets and raw labels.
#[derive(Debug, Clone, Default)]
pub struct ImageBatch {
    images: Vec<TensorImage>,
    targets: Vec<Vec<f32>>,
    labels: Vec<u8>,
}

impl ImageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            images: Vec::with_capacity(n),
            targets: Vec::with_capacity(n),
            labels: Vec::with_capacity(n),
        }
    }

    /// Append one sample. All images in a batch must share one shape.
    pub fn push(&mut self, image: TensorImage, target: Vec<f32>, label: u8) -> Result<()> {
        if let Some(first) = self.images.first() {
            if first.shape() != image.shape() {
                return Err(EngineError::config(format!(
                    "batch images must share one shape: {} vs {}",
                    first.shape(),
                    image.shape()
                )));
            }
        }
        self.images.push(image);
        self.targets.push(target);
        self.labels.push(label);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn image_shape(&self) -> Option<ImageShape> {
        self.images.first().map(TensorImage::shape)
    }

    pub fn images(&self) -> &[TensorImage] {
        &self.images
    }

    pub fn targets(&self) -> &[Vec<f32>] {
        &self.targets
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    /// Concatenate all images into one `[batch × element_count]` buffer.
    pub fn flatten_images(&self) -> Vec<f32> {
        let per_image = self.image_shape().map_or(0, |s| s.element_count());
        let mut flat = Vec::with_capacity(per_image * self.len());
        for image in &self.images {
            flat.extend_from_slice(image.data());
        }
        flat
    }

    /// Concatenate all targets into one `[batch × target_len]` buffer.
    pub fn flatten_targets(&self) -> Vec<f32> {
        self.targets.iter().flatten().copied().collect()
    }
}

/// One-hot vector of `class_count` entries with a single `1` at `label`.
pub fn one_hot(label: u8, class_count: usize) -> Result<Vec<f32>> {
    let index = label as usize;
    if index >= class_count {
        return Err(EngineError::DataBounds(format!(
            "label {} outside [0, {})",
            label, class_count
        )));
    }
    let mut target = vec![0.0f32; class_count];
    target[index] = 1.0;
    Ok(target)
}
