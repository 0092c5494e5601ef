//! visiontrain - image classifier training engine
//!
//! This crate trains image classifiers on candle with a per-step warmup +
//! cosine learning rate schedule, dynamic loss scaling for fp16, warmup-gated
//! gradient clipping and streaming top-1/top-5 metrics with a configurable
//! evaluation cadence.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use candle_core::DType;
//! use candle_nn::{VarBuilder, VarMap};
//! use visiontrain::model::build_classifier;
//! use visiontrain::training::{DataLoader, DataLoaderConfig, TensorDataset, TrainingConfig, TrainingSession};
//!
//! let config = TrainingConfig::load(None)?;
//! let device = config.runtime.create_device()?;
//! let train = DataLoader::new(Arc::new(TensorDataset::from_safetensors("train.safetensors", 1000)?),
//!     DataLoaderConfig::for_training(&config), device.clone())?;
//! let val = DataLoader::new(Arc::new(TensorDataset::from_safetensors("val.safetensors", 1000)?),
//!     DataLoaderConfig::for_evaluation(&config), device.clone())?;
//!
//! let var_map = VarMap::new();
//! let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
//! let model = build_classifier(&config.model, config.compute_dtype(), vb)?;
//! let mut session = TrainingSession::new(config, model, &var_map, train.num_batches())?;
//! let report = session.run(&train, &val).await?;
//! ```

#![warn(rustdoc::broken_intra_doc_links)]

pub mod error;
pub mod logging;
pub mod model;
pub mod training;

// Re-exports
pub use error::{Error, Result};
pub use model::{build_classifier, Backbone, ClassifierHead, ConvBackbone, ImageClassifier};
pub use training::{TrainingConfig, TrainingReport, TrainingSession};
