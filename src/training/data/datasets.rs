//! Dataset implementations for classifier training

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::{debug, info};

use super::{Dataset, DatasetMetadata, ImageSample};
use crate::error::{Error, Result};

/// Tensor key holding the image stack in a safetensors file
pub const IMAGES_KEY: &str = "images";

/// Tensor key holding the labels in a safetensors file
pub const LABELS_KEY: &str = "labels";

/// In-memory dataset backed by one image tensor and a label vector
pub struct TensorDataset {
    /// Dataset metadata
    metadata: DatasetMetadata,
    /// Images, `(samples, channels, height, width)`, f32 on the CPU
    images: Tensor,
    /// Class labels
    labels: Vec<u32>,
}

impl TensorDataset {
    /// Create a dataset from an image stack and a label tensor
    pub fn from_tensors(
        name: impl Into<String>,
        images: Tensor,
        labels: &Tensor,
        num_classes: usize,
    ) -> Result<Self> {
        let (num_samples, channels, height, width) = images.dims4().map_err(|_| {
            Error::data(format!(
                "images must be (samples, channels, height, width), got {:?}",
                images.dims()
            ))
        })?;
        let labels = labels.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;

        if labels.len() != num_samples {
            return Err(Error::data(format!(
                "{} images but {} labels",
                num_samples,
                labels.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|&&l| l as usize >= num_classes) {
            return Err(Error::data(format!(
                "label {} out of range for {} classes",
                bad, num_classes
            )));
        }

        let images = images.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        let metadata = DatasetMetadata {
            name: name.into(),
            num_samples,
            num_classes,
            image_shape: (channels, height, width),
        };

        Ok(Self {
            metadata,
            images,
            labels,
        })
    }

    /// Load `images` and `labels` tensors from a safetensors file
    pub fn from_safetensors(path: impl AsRef<Path>, num_classes: usize) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading dataset from {:?}", path);

        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let images = tensors
            .remove(IMAGES_KEY)
            .ok_or_else(|| Error::data(format!("{:?} has no '{}' tensor", path, IMAGES_KEY)))?;
        let labels = tensors
            .remove(LABELS_KEY)
            .ok_or_else(|| Error::data(format!("{:?} has no '{}' tensor", path, LABELS_KEY)))?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        let dataset = Self::from_tensors(name, images, &labels, num_classes)?;
        info!(
            "Loaded {} samples of shape {:?}",
            dataset.len(),
            dataset.metadata.image_shape
        );
        Ok(dataset)
    }

    /// Generate a class-separable synthetic dataset
    ///
    /// Every class gets a fixed random prototype image and each sample is
    /// its prototype plus Gaussian noise, so a model can actually learn it.
    pub fn synthetic(
        num_samples: usize,
        num_classes: usize,
        image_shape: (usize, usize, usize),
        seed: u64,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(Error::data("Synthetic dataset needs at least one class"));
        }

        let (channels, height, width) = image_shape;
        let pixels = channels * height * width;
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0f32, 1.0).map_err(|e| Error::data(e.to_string()))?;

        let prototypes: Vec<Vec<f32>> = (0..num_classes)
            .map(|_| (0..pixels).map(|_| normal.sample(&mut rng)).collect())
            .collect();

        let mut data = Vec::with_capacity(num_samples * pixels);
        let mut labels = Vec::with_capacity(num_samples);
        for _ in 0..num_samples {
            let label = rng.random_range(0..num_classes);
            labels.push(label as u32);
            data.extend(
                prototypes[label]
                    .iter()
                    .map(|&p| p + 0.5 * normal.sample(&mut rng)),
            );
        }
        debug!("Generated {} synthetic samples over {} classes", num_samples, num_classes);

        let images = Tensor::from_vec(data, (num_samples, channels, height, width), &Device::Cpu)?;
        let labels = Tensor::new(labels, &Device::Cpu)?;
        Self::from_tensors("synthetic", images, &labels, num_classes)
    }

    /// Split off the trailing `count` samples as a second dataset
    pub fn split_tail(self, count: usize) -> Result<(Self, Self)> {
        let total = self.len();
        if count > total {
            return Err(Error::data(format!("cannot split {} of {} samples", count, total)));
        }
        let head = total - count;
        let num_classes = self.metadata.num_classes;
        let name = self.metadata.name.clone();

        let head_labels = Tensor::new(&self.labels[..head], &Device::Cpu)?;
        let tail_labels = Tensor::new(&self.labels[head..], &Device::Cpu)?;
        let first = Self::from_tensors(
            format!("{}-train", name),
            self.images.narrow(0, 0, head)?,
            &head_labels,
            num_classes,
        )?;
        let second = Self::from_tensors(
            format!("{}-val", name),
            self.images.narrow(0, head, count)?,
            &tail_labels,
            num_classes,
        )?;
        Ok((first, second))
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, index: usize) -> Result<ImageSample> {
        if index >= self.labels.len() {
            return Err(Error::invalid_input(format!(
                "sample index {} >= dataset size {}",
                index,
                self.labels.len()
            )));
        }

        Ok(ImageSample {
            image: self.images.get(index)?,
            label: self.labels[index],
        })
    }

    fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_tensors_validates_shapes() {
        let device = Device::Cpu;
        let images = Tensor::zeros((4, 1, 2, 2), DType::F32, &device).unwrap();

        let labels = Tensor::new(&[0u32, 1, 2], &device).unwrap();
        assert!(TensorDataset::from_tensors("bad", images.clone(), &labels, 3).is_err());

        let labels = Tensor::new(&[0u32, 1, 2, 3], &device).unwrap();
        assert!(TensorDataset::from_tensors("bad", images.clone(), &labels, 3).is_err());

        let dataset = TensorDataset::from_tensors("ok", images, &labels, 4).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.metadata().image_shape, (1, 2, 2));
    }

    #[test]
    fn test_get_returns_sample() {
        let dataset = TensorDataset::synthetic(10, 3, (1, 4, 4), 7).unwrap();
        let sample = dataset.get(9).unwrap();
        assert_eq!(sample.image.dims(), &[1, 4, 4]);
        assert!(sample.label < 3);
        assert!(dataset.get(10).is_err());
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let a = TensorDataset::synthetic(8, 4, (1, 2, 2), 42).unwrap();
        let b = TensorDataset::synthetic(8, 4, (1, 2, 2), 42).unwrap();
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn test_safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.safetensors");

        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            IMAGES_KEY.to_string(),
            Tensor::ones((3, 1, 2, 2), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            LABELS_KEY.to_string(),
            Tensor::new(&[2i64, 0, 1], &device).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let dataset = TensorDataset::from_safetensors(&path, 3).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.metadata().name, "tiny");
        assert_eq!(dataset.get(0).unwrap().label, 2);
    }

    #[test]
    fn test_missing_tensor_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.safetensors");

        let mut tensors = HashMap::new();
        tensors.insert(
            IMAGES_KEY.to_string(),
            Tensor::ones((1, 1, 1, 1), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        assert!(TensorDataset::from_safetensors(&path, 2).is_err());
    }

    #[test]
    fn test_split_tail() {
        let dataset = TensorDataset::synthetic(10, 2, (1, 2, 2), 1).unwrap();
        let (train, val) = dataset.split_tail(3).unwrap();
        assert_eq!(train.len(), 7);
        assert_eq!(val.len(), 3);
        assert_eq!(val.metadata().name, "synthetic-val");
    }
}
