//! Data loading infrastructure for classifier training
//!
//! This module provides the dataset abstraction, an in-memory tensor dataset
//! and an ordered, prefetching data loader producing collated batches.

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

pub mod datasets;
pub mod loaders;

// Re-exports
pub use datasets::TensorDataset;
pub use loaders::{DataLoader, DataLoaderBuilder, DataLoaderConfig, EpochStream};

/// Common trait for all training datasets
pub trait Dataset: Send + Sync {
    /// Get the number of samples in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a sample by index
    fn get(&self, index: usize) -> Result<ImageSample>;

    /// Get dataset metadata
    fn metadata(&self) -> &DatasetMetadata;
}

/// A single image with its class label
#[derive(Debug, Clone)]
pub struct ImageSample {
    /// Image tensor, `(channels, height, width)`
    pub image: Tensor,
    /// Class index
    pub label: u32,
}

/// Dataset metadata
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatasetMetadata {
    /// Dataset name/identifier
    pub name: String,
    /// Number of samples
    pub num_samples: usize,
    /// Number of classes
    pub num_classes: usize,
    /// Per-sample image shape `(channels, height, width)`
    pub image_shape: (usize, usize, usize),
}

/// A collated batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// Images, `(batch, channels, height, width)`
    pub images: Tensor,
    /// Labels, `(batch,)` u32
    pub labels: Tensor,
}

impl Batch {
    /// Stack samples into one batch on `device`
    pub fn collate(samples: Vec<ImageSample>, device: &Device) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::data("Cannot collate an empty batch"));
        }

        let labels: Vec<u32> = samples.iter().map(|s| s.label).collect();
        let images: Vec<Tensor> = samples.into_iter().map(|s| s.image).collect();

        let images = Tensor::stack(&images, 0)?.to_device(device)?;
        let labels = Tensor::new(labels, device)?;
        Ok(Self { images, labels })
    }

    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.labels.dims1().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
