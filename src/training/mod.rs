//! Training infrastructure for image classifiers
//!
//! # Main Components
//!
//! - **Configuration**: layered training configuration
//! - **Optimizers**: SGD and AdamW with fp32 master weights, the warmup +
//!   cosine schedule and warmup-gated gradient clipping
//! - **Precision**: dynamic loss scaling
//! - **Metrics**: streaming top-k accumulator and metric histories
//! - **Cadence**: epoch-level evaluation controller
//! - **Step**: one optimization step
//! - **Session**: the epoch loop and run report
//! - **Data**: datasets and the prefetching loader

pub mod cadence;
pub mod config;
pub mod data;
pub mod metrics;
pub mod optimizers;
pub mod precision;
pub mod session;
pub mod step;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{
    ClipGateUnit, DataConfig, DeviceType, GradientClippingConfig, LogLevel, LoggingConfig,
    LossScalingConfig, MixedPrecisionConfig, ModelConfig, OptimizerConfig, OptimizerType,
    PrecisionType, RuntimeConfig, SchedulerConfig, TrainingConfig, TrainingParams,
};

// Session re-exports
pub use session::{
    EpochSummary, TrainingEvent, TrainingReport, TrainingSession, TrainingState, TrainingStatus,
};

// Data re-exports
pub use data::{Batch, DataLoader, DataLoaderConfig, Dataset, ImageSample, TensorDataset};

// Metrics re-exports
pub use cadence::{EpochReport, EvaluationCadence};
pub use metrics::{EpochRecord, MetricAccumulator, MetricField, MetricHistory};

// Optimizer re-exports
pub use optimizers::{
    create_optimizer, create_scheduler, GradientClipper, Optimizer, Scheduler,
    WarmupCosineScheduler,
};
pub use precision::GradScaler;
pub use step::{StepExecutor, StepOutcome};

/// Result type for training operations
pub type Result<T> = crate::error::Result<T>;
