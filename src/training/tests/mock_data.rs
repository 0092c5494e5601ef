//! Mock datasets for testing

use candle_core::{Device, Tensor};

use crate::error::Result;
use crate::training::data::{Dataset, DatasetMetadata, ImageSample, TensorDataset};

/// Learnable synthetic dataset
pub fn create_mock_dataset(
    num_samples: usize,
    num_classes: usize,
    image_shape: (usize, usize, usize),
    seed: u64,
) -> TensorDataset {
    TensorDataset::synthetic(num_samples, num_classes, image_shape, seed)
        .expect("synthetic dataset")
}

/// Dataset with no samples
pub struct EmptyDataset {
    metadata: DatasetMetadata,
}

impl EmptyDataset {
    pub fn new(num_classes: usize, image_shape: (usize, usize, usize)) -> Self {
        Self {
            metadata: DatasetMetadata {
                name: "empty".to_string(),
                num_samples: 0,
                num_classes,
                image_shape,
            },
        }
    }
}

impl Dataset for EmptyDataset {
    fn len(&self) -> usize {
        0
    }

    fn get(&self, index: usize) -> Result<ImageSample> {
        Err(crate::error::Error::invalid_input(format!(
            "empty dataset has no sample {}",
            index
        )))
    }

    fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }
}

/// Dataset whose images are all NaN, so every training step overflows
pub struct NanDataset {
    metadata: DatasetMetadata,
}

impl NanDataset {
    pub fn new(num_samples: usize, num_classes: usize, image_shape: (usize, usize, usize)) -> Self {
        Self {
            metadata: DatasetMetadata {
                name: "nan".to_string(),
                num_samples,
                num_classes,
                image_shape,
            },
        }
    }
}

impl Dataset for NanDataset {
    fn len(&self) -> usize {
        self.metadata.num_samples
    }

    fn get(&self, index: usize) -> Result<ImageSample> {
        let image = Tensor::full(f32::NAN, self.metadata.image_shape, &Device::Cpu)?;
        Ok(ImageSample {
            image,
            label: (index % self.metadata.num_classes) as u32,
        })
    }

    fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }
}

/// Finite synthetic samples followed by NaN samples from `nan_from` on
pub struct PartlyNanDataset {
    inner: TensorDataset,
    nan_from: usize,
}

impl PartlyNanDataset {
    pub fn new(inner: TensorDataset, nan_from: usize) -> Self {
        Self { inner, nan_from }
    }
}

impl Dataset for PartlyNanDataset {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> Result<ImageSample> {
        let sample = self.inner.get(index)?;
        if index < self.nan_from {
            return Ok(sample);
        }
        let image = Tensor::full(f32::NAN, sample.image.dims(), &Device::Cpu)?;
        Ok(ImageSample {
            image,
            label: sample.label,
        })
    }

    fn metadata(&self) -> &DatasetMetadata {
        self.inner.metadata()
    }
}
