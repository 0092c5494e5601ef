//! Data loaders for classifier training with background prefetching
//!
//! Batches for an epoch are produced on a blocking task, with the samples of
//! each batch loaded in parallel on a dedicated rayon pool, and handed to the
//! training loop through a bounded channel in order.

use std::sync::Arc;
use std::time::Duration;

use candle_core::Device;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Batch, Dataset, ImageSample};
use crate::error::{Error, Result};
use crate::training::config::TrainingConfig;

/// Configuration for DataLoader
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Whether to shuffle data every epoch
    pub shuffle: bool,
    /// Number of worker threads for sample loading, 0 loads inline
    pub num_workers: usize,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Batches prefetched per worker
    pub prefetch_factor: usize,
    /// How long to wait for a batch before giving up
    pub stall_timeout: Option<Duration>,
    /// Base seed; epoch `e` shuffles with `seed + e`
    pub seed: u64,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            num_workers: 4,
            drop_last: false,
            prefetch_factor: 2,
            stall_timeout: None,
            seed: 0,
        }
    }
}

impl DataLoaderConfig {
    /// Training loader settings
    pub fn for_training(config: &TrainingConfig) -> Self {
        Self {
            batch_size: config.training.batch_size,
            shuffle: config.data.shuffle,
            num_workers: config.data.num_workers,
            drop_last: config.data.drop_last,
            prefetch_factor: config.data.prefetch_factor,
            stall_timeout: config.data.stall_timeout_secs.map(Duration::from_secs),
            seed: config.training.seed,
        }
    }

    /// Evaluation loader settings: fixed order, every sample kept
    pub fn for_evaluation(config: &TrainingConfig) -> Self {
        Self {
            shuffle: false,
            drop_last: false,
            ..Self::for_training(config)
        }
    }

    /// Depth of the prefetch channel
    pub fn buffer_size(&self) -> usize {
        (self.num_workers * self.prefetch_factor).max(1)
    }
}

/// Ordered, prefetching data loader
pub struct DataLoader<D: Dataset + 'static> {
    /// Dataset reference
    dataset: Arc<D>,
    /// DataLoader configuration
    config: DataLoaderConfig,
    /// Device batches are moved to
    device: Device,
    /// Sample loading pool, `None` when loading inline
    pool: Option<Arc<ThreadPool>>,
}

impl<D: Dataset + 'static> DataLoader<D> {
    /// Create a new DataLoader
    pub fn new(dataset: Arc<D>, config: DataLoaderConfig, device: Device) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }

        let pool = if config.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_workers)
                .thread_name(|i| format!("visiontrain-loader-{}", i))
                .build()
                .map_err(|e| Error::data(format!("Failed to build loader pool: {}", e)))?;
            Some(Arc::new(pool))
        } else {
            None
        };

        info!(
            "Creating DataLoader for '{}' with batch_size={}, num_workers={}, shuffle={}",
            dataset.metadata().name,
            config.batch_size,
            config.num_workers,
            config.shuffle
        );

        Ok(Self {
            dataset,
            config,
            device,
            pool,
        })
    }

    /// Get the number of batches per epoch
    pub fn num_batches(&self) -> usize {
        let dataset_size = self.dataset.len();
        if self.config.drop_last {
            dataset_size / self.config.batch_size
        } else {
            dataset_size.div_ceil(self.config.batch_size)
        }
    }

    /// Get dataset size
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    /// Get dataset metadata
    pub fn metadata(&self) -> &super::DatasetMetadata {
        self.dataset.metadata()
    }

    /// Loader configuration
    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Start producing the batches of `epoch`
    ///
    /// Must be called from within a tokio runtime.
    pub fn epoch_stream(&self, epoch: usize) -> EpochStream {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }

        let batches = self.create_batches(indices);
        let total_batches = batches.len();
        debug!("Epoch {} of '{}': {} batches", epoch, self.metadata().name, total_batches);

        let (sender, receiver) = mpsc::channel(self.config.buffer_size());
        let dataset = self.dataset.clone();
        let pool = self.pool.clone();
        let device = self.device.clone();

        let producer = tokio::task::spawn_blocking(move || {
            for (batch_idx, indices) in batches.into_iter().enumerate() {
                let batch = load_batch(dataset.as_ref(), pool.as_deref(), &indices, &device);
                let failed = batch.is_err();
                if let Err(e) = &batch {
                    error!("Batch {} of epoch {} failed: {}", batch_idx, epoch, e);
                }
                if sender.blocking_send(batch).is_err() {
                    debug!("Epoch {} consumer dropped, stopping producer", epoch);
                    break;
                }
                if failed {
                    break;
                }
            }
        });

        EpochStream {
            receiver,
            producer,
            batches_received: 0,
            total_batches,
            stall_timeout: self.config.stall_timeout,
            epoch,
        }
    }

    /// Create batches from indices
    fn create_batches(&self, indices: Vec<usize>) -> Vec<Vec<usize>> {
        indices
            .chunks(self.config.batch_size)
            .filter(|chunk| !self.config.drop_last || chunk.len() == self.config.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

/// Load and collate one batch, in parallel when a pool is available
fn load_batch<D: Dataset>(
    dataset: &D,
    pool: Option<&ThreadPool>,
    indices: &[usize],
    device: &Device,
) -> Result<Batch> {
    let samples: Vec<ImageSample> = match pool {
        Some(pool) => pool.install(|| {
            indices
                .par_iter()
                .map(|&idx| dataset.get(idx))
                .collect::<Result<Vec<_>>>()
        })?,
        None => indices
            .iter()
            .map(|&idx| dataset.get(idx))
            .collect::<Result<Vec<_>>>()?,
    };

    Batch::collate(samples, device)
}

/// Ordered batches of one epoch
pub struct EpochStream {
    /// Channel receiver for batches
    receiver: mpsc::Receiver<Result<Batch>>,
    /// Background producer
    producer: JoinHandle<()>,
    /// Number of batches handed out
    batches_received: usize,
    /// Total number of batches
    total_batches: usize,
    /// Stall limit
    stall_timeout: Option<Duration>,
    /// Epoch number
    epoch: usize,
}

impl EpochStream {
    /// Wait for the next batch, `None` once the epoch is exhausted
    ///
    /// Fails with [`Error::DataStall`] when no batch arrives within the
    /// configured stall timeout.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>> {
        let received = match self.stall_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.receiver.recv()).await {
                Ok(item) => item,
                Err(_) => {
                    warn!(
                        "No batch received for {:?} in epoch {} ({}/{} batches)",
                        limit, self.epoch, self.batches_received, self.total_batches
                    );
                    return Err(Error::DataStall { waited: limit });
                }
            },
            None => self.receiver.recv().await,
        };

        match received {
            Some(Ok(batch)) => {
                self.batches_received += 1;
                Ok(Some(batch))
            }
            Some(Err(e)) => Err(e),
            None if self.batches_received < self.total_batches => Err(Error::data(format!(
                "Producer for epoch {} stopped after {} of {} batches",
                self.epoch, self.batches_received, self.total_batches
            ))),
            None => Ok(None),
        }
    }

    /// Get the number of batches received
    pub fn batches_received(&self) -> usize {
        self.batches_received
    }

    /// Get the total number of batches
    pub fn total_batches(&self) -> usize {
        self.total_batches
    }

    /// Get the epoch
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Get progress as a fraction (0.0 to 1.0)
    pub fn progress(&self) -> f32 {
        if self.total_batches == 0 {
            1.0
        } else {
            self.batches_received as f32 / self.total_batches as f32
        }
    }

    /// Whether the producer has exited
    pub fn producer_finished(&self) -> bool {
        self.producer.is_finished()
    }
}

/// Builder pattern for DataLoader
pub struct DataLoaderBuilder<D: Dataset + 'static> {
    dataset: Arc<D>,
    config: DataLoaderConfig,
    device: Device,
}

impl<D: Dataset + 'static> DataLoaderBuilder<D> {
    /// Create a new DataLoader builder
    pub fn new(dataset: Arc<D>) -> Self {
        Self {
            dataset,
            config: DataLoaderConfig::default(),
            device: Device::Cpu,
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: DataLoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Set batch size
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set shuffle
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.config.shuffle = shuffle;
        self
    }

    /// Set number of workers
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    /// Set drop last
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.config.drop_last = drop_last;
        self
    }

    /// Set stall timeout
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.stall_timeout = Some(timeout);
        self
    }

    /// Set seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Set target device
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Build the DataLoader
    pub fn build(self) -> Result<DataLoader<D>> {
        DataLoader::new(self.dataset, self.config, self.device)
    }
}
