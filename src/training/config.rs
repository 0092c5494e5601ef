//! Training configuration system
//!
//! This module provides the configuration structures for a classifier training
//! run: model shape, optimization settings, the evaluation cadence, data
//! loading, mixed precision and runtime placement. Every constant the run
//! depends on lives here as a named option.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Environment variable prefix for layered configuration
pub const ENV_PREFIX: &str = "VISIONTRAIN";

/// Main training configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Model configuration
    pub model: ModelConfig,

    /// Optimization configuration
    pub optimizer: OptimizerConfig,

    /// Training parameters
    pub training: TrainingParams,

    /// Data configuration
    pub data: DataConfig,

    /// Mixed precision training settings
    pub mixed_precision: MixedPrecisionConfig,

    /// Runtime configuration
    pub runtime: RuntimeConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Model-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of output classes
    pub num_classes: usize,

    /// Width of the backbone feature vector fed to the head
    pub feature_dim: usize,

    /// Hidden width of the classification head
    pub hidden_dim: usize,

    /// Dropout rate inside the classification head
    pub dropout: f64,

    /// Square input resolution
    pub image_size: usize,

    /// Input channels
    pub in_channels: usize,

    /// Channel widths of the strided convolution stages of the backbone
    pub backbone_widths: Vec<usize>,
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Optimizer type
    pub optimizer_type: OptimizerType,

    /// Base learning rate
    pub learning_rate: f64,

    /// Weight decay coefficient
    pub weight_decay: f64,

    /// Learning rate scheduler
    pub scheduler: SchedulerConfig,

    /// Gradient clipping settings
    pub gradient_clipping: GradientClippingConfig,
}

/// Optimizer types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerType {
    /// Stochastic gradient descent with momentum
    Sgd { momentum: f64, nesterov: bool },
    /// Adam with decoupled weight decay
    AdamW { beta1: f64, beta2: f64, epsilon: f64 },
}

/// Warmup + cosine schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fraction of total steps spent warming up
    pub warmup_fraction: f64,

    /// Explicit warmup step count, overrides `warmup_fraction`
    pub warmup_steps: Option<usize>,

    /// Advance the schedule on steps the loss scaler skipped
    pub advance_on_skip: bool,
}

/// Gradient clipping configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GradientClippingConfig {
    /// Enable gradient clipping
    pub enabled: bool,

    /// Maximum global L2 norm
    pub max_norm: f64,

    /// Counter compared against the warmup length to open the gate
    pub gate: ClipGateUnit,
}

/// Unit the clipping gate compares against the warmup step count
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClipGateUnit {
    /// Compare the global optimization step with the warmup steps
    Step,
    /// Compare the epoch index with the warmup steps (legacy behaviour)
    Epoch,
}

/// Core training parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingParams {
    /// Number of training epochs
    pub num_epochs: usize,

    /// Batch size for training and evaluation
    pub batch_size: usize,

    /// Epochs between full validation passes
    pub eval_interval: usize,

    /// Seed for shuffling and initialization
    pub seed: u64,

    /// Logging frequency (in steps)
    pub log_steps: usize,

    /// Count batches whose update was skipped in the training metrics
    pub metrics_include_skipped_steps: bool,
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// Training data (safetensors with `images` and `labels`)
    pub train_path: Option<PathBuf>,

    /// Validation data (safetensors with `images` and `labels`)
    pub val_path: Option<PathBuf>,

    /// Number of data loading workers
    pub num_workers: usize,

    /// Batches prefetched per worker
    pub prefetch_factor: usize,

    /// Shuffle the training set every epoch
    pub shuffle: bool,

    /// Drop the final partial training batch
    pub drop_last: bool,

    /// Seconds to wait for a batch before failing the run
    pub stall_timeout_secs: Option<u64>,
}

/// Mixed precision training configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MixedPrecisionConfig {
    /// Enable mixed precision training
    pub enabled: bool,

    /// Precision type
    pub precision: PrecisionType,

    /// Loss scaling
    pub loss_scaling: LossScalingConfig,
}

/// Precision types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionType {
    FP16,
    BF16,
    FP32,
}

impl PrecisionType {
    /// Tensor dtype used for parameters and activations
    pub fn dtype(&self) -> DType {
        match self {
            PrecisionType::FP16 => DType::F16,
            PrecisionType::BF16 => DType::BF16,
            PrecisionType::FP32 => DType::F32,
        }
    }

    /// Whether gradients need loss scaling to stay representable
    pub fn needs_loss_scaling(&self) -> bool {
        matches!(self, PrecisionType::FP16)
    }
}

/// Dynamic loss scaling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LossScalingConfig {
    /// Initial scale
    pub init_scale: f64,

    /// Growth factor
    pub growth_factor: f64,

    /// Backoff factor
    pub backoff_factor: f64,

    /// Consecutive finite steps before the scale grows
    pub growth_interval: usize,

    /// Lower bound for the scale
    pub min_scale: f64,

    /// Consecutive skipped steps that trigger a warning
    pub skip_warning_threshold: usize,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Device type
    pub device: DeviceType,

    /// Device ordinal
    pub device_id: usize,

    /// Fall back to the CPU when the accelerator cannot be opened
    pub allow_cpu_fallback: bool,
}

/// Supported device types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Cuda,
    Metal,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl TrainingConfig {
    /// Create a new training configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON or YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        let config: Self = if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON or YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };

        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Layer defaults, an optional file and `VISIONTRAIN__SECTION__KEY`
    /// environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Model
        if self.model.num_classes == 0 {
            return Err(Error::config("Number of classes must be greater than 0"));
        }
        if self.model.feature_dim == 0 || self.model.hidden_dim == 0 {
            return Err(Error::config("Feature and hidden dimensions must be greater than 0"));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(Error::config("Dropout must be in [0.0, 1.0)"));
        }
        if self.model.image_size == 0 || self.model.in_channels == 0 {
            return Err(Error::config("Image size and channel count must be greater than 0"));
        }
        if self.model.backbone_widths.iter().any(|&w| w == 0) {
            return Err(Error::config("Backbone stage widths must be greater than 0"));
        }

        // Training parameters
        if self.training.num_epochs == 0 {
            return Err(Error::config("Number of epochs must be greater than 0"));
        }
        if self.training.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }
        if self.training.eval_interval == 0 {
            return Err(Error::config("Evaluation interval must be greater than 0"));
        }
        if self.training.log_steps == 0 {
            return Err(Error::config("Log steps must be greater than 0"));
        }

        // Optimizer
        if !(self.optimizer.learning_rate > 0.0) {
            return Err(Error::config("Learning rate must be positive"));
        }
        if self.optimizer.weight_decay < 0.0 {
            return Err(Error::config("Weight decay must be non-negative"));
        }
        match &self.optimizer.optimizer_type {
            OptimizerType::Sgd { momentum, nesterov } => {
                if !(0.0..1.0).contains(momentum) {
                    return Err(Error::config("SGD momentum must be in [0.0, 1.0)"));
                }
                if *nesterov && *momentum <= 0.0 {
                    return Err(Error::config("Nesterov momentum requires momentum > 0"));
                }
            }
            OptimizerType::AdamW { beta1, beta2, epsilon } => {
                if !(0.0..1.0).contains(beta1) || !(0.0..1.0).contains(beta2) {
                    return Err(Error::config("AdamW betas must be in [0.0, 1.0)"));
                }
                if *epsilon <= 0.0 {
                    return Err(Error::config("AdamW epsilon must be positive"));
                }
            }
        }
        if !(0.0..1.0).contains(&self.optimizer.scheduler.warmup_fraction) {
            return Err(Error::config("Warmup fraction must be in [0.0, 1.0)"));
        }
        let clipping = &self.optimizer.gradient_clipping;
        if clipping.enabled && !(clipping.max_norm > 0.0) {
            return Err(Error::config("Gradient clipping max norm must be positive"));
        }

        // Data
        if self.data.prefetch_factor == 0 {
            return Err(Error::config("Prefetch factor must be greater than 0"));
        }
        if self.data.stall_timeout_secs == Some(0) {
            return Err(Error::config("Stall timeout must be greater than 0 seconds"));
        }

        // Loss scaling
        let scaling = &self.mixed_precision.loss_scaling;
        if !(scaling.init_scale > 0.0) || !(scaling.min_scale > 0.0) {
            return Err(Error::config("Loss scales must be positive"));
        }
        if scaling.init_scale < scaling.min_scale {
            return Err(Error::config("Initial loss scale is below the minimum scale"));
        }
        if scaling.growth_factor <= 1.0 {
            return Err(Error::config("Loss scale growth factor must be greater than 1"));
        }
        if !(scaling.backoff_factor > 0.0 && scaling.backoff_factor < 1.0) {
            return Err(Error::config("Loss scale backoff factor must be in (0.0, 1.0)"));
        }
        if scaling.growth_interval == 0 {
            return Err(Error::config("Loss scale growth interval must be greater than 0"));
        }

        Ok(())
    }

    /// Dtype the forward pass computes in; parameters always stay fp32
    pub fn compute_dtype(&self) -> DType {
        if self.mixed_precision.enabled {
            self.mixed_precision.precision.dtype()
        } else {
            DType::F32
        }
    }

    /// Whether the loss scaler should actively scale the loss
    pub fn loss_scaling_active(&self) -> bool {
        self.mixed_precision.enabled && self.mixed_precision.precision.needs_loss_scaling()
    }

    /// Total optimization steps for a loader yielding `steps_per_epoch` batches
    pub fn total_steps(&self, steps_per_epoch: usize) -> usize {
        steps_per_epoch * self.training.num_epochs
    }

    /// Warmup length for a run of `total_steps`
    pub fn warmup_steps(&self, total_steps: usize) -> usize {
        match self.optimizer.scheduler.warmup_steps {
            Some(steps) => steps,
            None => (total_steps as f64 * self.optimizer.scheduler.warmup_fraction).floor() as usize,
        }
    }
}

impl RuntimeConfig {
    /// Open the configured compute device
    pub fn create_device(&self) -> Result<Device> {
        let opened = match self.device {
            DeviceType::Cpu => return Ok(Device::Cpu),
            DeviceType::Cuda => Device::new_cuda(self.device_id),
            DeviceType::Metal => Device::new_metal(self.device_id),
        };

        match opened {
            Ok(device) => Ok(device),
            Err(e) if self.allow_cpu_fallback => {
                warn!("{:?}:{} unavailable ({}), falling back to CPU", self.device, self.device_id, e);
                Ok(Device::Cpu)
            }
            Err(e) => Err(Error::device(format!(
                "{:?}:{} unavailable: {}",
                self.device, self.device_id, e
            ))),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: 1000,
            feature_dim: 1280,
            hidden_dim: 1024,
            dropout: 0.2,
            image_size: 224,
            in_channels: 3,
            backbone_widths: vec![32, 64, 128],
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::Sgd {
                momentum: 0.9,
                nesterov: true,
            },
            learning_rate: 0.08,
            weight_decay: 1e-4,
            scheduler: SchedulerConfig::default(),
            gradient_clipping: GradientClippingConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warmup_fraction: 0.01,
            warmup_steps: None,
            advance_on_skip: true,
        }
    }
}

impl Default for GradientClippingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_norm: 1.0,
            gate: ClipGateUnit::Step,
        }
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_epochs: 36,
            batch_size: 256,
            eval_interval: 1,
            seed: 42,
            log_steps: 100,
            metrics_include_skipped_steps: false,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_path: None,
            val_path: None,
            num_workers: 16,
            prefetch_factor: 4,
            shuffle: true,
            drop_last: false,
            stall_timeout_secs: Some(600),
        }
    }
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            precision: PrecisionType::FP16,
            loss_scaling: LossScalingConfig::default(),
        }
    }
}

impl Default for LossScalingConfig {
    fn default() -> Self {
        Self {
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            skip_warning_threshold: 10,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceType::Cuda,
            device_id: 0,
            allow_cpu_fallback: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            optimizer: OptimizerConfig::default(),
            training: TrainingParams::default(),
            data: DataConfig::default(),
            mixed_precision: MixedPrecisionConfig::default(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
