use anyhow::{bail, Context, Result};
use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use visiontrain::logging::init_logging;
use visiontrain::model::build_classifier;
use visiontrain::training::{
    DataLoader, DataLoaderConfig, DeviceType, LogLevel, PrecisionType, TensorDataset, TrainingConfig,
    TrainingEvent, TrainingSession,
};

#[derive(Parser)]
#[command(name = "visiontrain")]
#[command(about = "Image classifier training with warmup + cosine schedules and mixed precision", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a classifier
    Train {
        /// Configuration file (JSON or YAML), layered under VISIONTRAIN__* variables
        #[arg(short, long, env = "VISIONTRAIN_CONFIG")]
        config: Option<PathBuf>,

        /// Training data (safetensors with `images` and `labels`)
        #[arg(long)]
        train_data: Option<PathBuf>,

        /// Validation data (safetensors with `images` and `labels`)
        #[arg(long)]
        val_data: Option<PathBuf>,

        /// Train on a generated dataset instead of files
        #[arg(long)]
        synthetic: bool,

        /// Number of generated samples, a fifth held out for validation
        #[arg(long, default_value_t = 2048)]
        synthetic_samples: usize,

        /// Override the number of epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Override the batch size
        #[arg(long)]
        batch_size: Option<usize>,

        /// Override the device
        #[arg(long, value_enum)]
        device: Option<DeviceArg>,

        /// Override the compute precision
        #[arg(long, value_enum)]
        precision: Option<PrecisionArg>,

        /// Write the run report as JSON
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Clone, Copy, ValueEnum)]
enum PrecisionArg {
    Fp16,
    Bf16,
    Fp32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            train_data,
            val_data,
            synthetic,
            synthetic_samples,
            epochs,
            batch_size,
            device,
            precision,
            report,
        } => {
            let mut config = TrainingConfig::load(config.as_deref())
                .context("Failed to load training configuration")?;
            init_logging(
                config.logging.level,
                cli.verbose,
                cli.quiet,
                cli.json_logs || config.logging.json,
            )?;

            if let Some(path) = train_data {
                config.data.train_path = Some(path);
            }
            if let Some(path) = val_data {
                config.data.val_path = Some(path);
            }
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(device) = device {
                config.runtime.device = match device {
                    DeviceArg::Cpu => DeviceType::Cpu,
                    DeviceArg::Cuda => DeviceType::Cuda,
                    DeviceArg::Metal => DeviceType::Metal,
                };
            }
            if let Some(precision) = precision {
                config.mixed_precision.precision = match precision {
                    PrecisionArg::Fp16 => PrecisionType::FP16,
                    PrecisionArg::Bf16 => PrecisionType::BF16,
                    PrecisionArg::Fp32 => PrecisionType::FP32,
                };
            }
            config.validate().context("Invalid configuration after overrides")?;

            train(config, synthetic, synthetic_samples, report).await?;
        }

        Commands::Config { file } => {
            init_logging(LogLevel::Info, cli.verbose, cli.quiet, cli.json_logs)?;
            validate_config(&file)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

async fn train(
    config: TrainingConfig,
    synthetic: bool,
    synthetic_samples: usize,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let device = config
        .runtime
        .create_device()
        .context("Failed to open compute device")?;
    info!("Using device {:?}, compute dtype {:?}", device, config.compute_dtype());

    let (train_set, val_set) = load_datasets(&config, synthetic, synthetic_samples)?;
    let train_loader = DataLoader::new(
        Arc::new(train_set),
        DataLoaderConfig::for_training(&config),
        device.clone(),
    )?;
    let val_loader = DataLoader::new(
        Arc::new(val_set),
        DataLoaderConfig::for_evaluation(&config),
        device.clone(),
    )?;
    info!(
        "Train: {} samples in {} batches, validation: {} samples",
        train_loader.dataset_size(),
        train_loader.num_batches(),
        val_loader.dataset_size()
    );

    let var_map = VarMap::new();
    // Parameters stay fp32; the model casts to the compute dtype per layer
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
    let model = build_classifier(&config.model, config.compute_dtype(), vb)
        .context("Failed to build classifier")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let monitor = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let TrainingEvent::Error { error } = event {
                warn!("Training reported an error: {}", error);
            }
        }
    });

    let steps_per_epoch = train_loader.num_batches();
    let mut session = TrainingSession::new(config, model, &var_map, steps_per_epoch)
        .context("Failed to create training session")?
        .with_event_monitoring(tx);
    let result = session.run(&train_loader, &val_loader).await;
    drop(session);
    monitor.await.context("Event monitor panicked")?;
    let report = result.context("Training failed")?;

    info!(
        "Training complete: {} steps ({} skipped) in {:.1}s",
        report.total_steps,
        report.skipped_steps,
        report.training_duration.as_secs_f64()
    );

    if let Some(path) = report_path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create report directory")?;
        }
        report.to_file(&path).context("Failed to write run report")?;
        info!("Report saved to: {}", path.display());
    }

    Ok(())
}

fn load_datasets(
    config: &TrainingConfig,
    synthetic: bool,
    synthetic_samples: usize,
) -> Result<(TensorDataset, TensorDataset)> {
    let num_classes = config.model.num_classes;

    if synthetic {
        let size = config.model.image_size;
        let dataset = TensorDataset::synthetic(
            synthetic_samples,
            num_classes,
            (config.model.in_channels, size, size),
            config.training.seed,
        )?;
        let held_out = synthetic_samples / 5;
        return Ok(dataset.split_tail(held_out)?);
    }

    let (Some(train_path), Some(val_path)) = (&config.data.train_path, &config.data.val_path) else {
        bail!("Both training and validation data are required (or pass --synthetic)");
    };
    let train = TensorDataset::from_safetensors(train_path, num_classes)
        .with_context(|| format!("Failed to load training data from {}", train_path.display()))?;
    let val = TensorDataset::from_safetensors(val_path, num_classes)
        .with_context(|| format!("Failed to load validation data from {}", val_path.display()))?;
    Ok((train, val))
}

fn validate_config(config_path: &Path) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = TrainingConfig::from_file(config_path).context("Failed to load configuration file")?;

    info!("Configuration is valid");
    info!("  - Classes: {}, image size {}", config.model.num_classes, config.model.image_size);
    info!(
        "  - Optimizer: {:?}, lr {}, weight decay {}",
        config.optimizer.optimizer_type, config.optimizer.learning_rate, config.optimizer.weight_decay
    );
    info!(
        "  - Epochs: {}, batch size {}, eval every {} epoch(s)",
        config.training.num_epochs, config.training.batch_size, config.training.eval_interval
    );
    info!(
        "  - Precision: {:?}, loss scaling {}",
        config.compute_dtype(),
        config.loss_scaling_active()
    );

    Ok(())
}

fn show_system_info() {
    println!("visiontrain - image classifier training");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  CUDA: compiled, {}", device_status(candle_core::Device::new_cuda(0).is_ok()));
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA: not compiled");

    #[cfg(feature = "metal")]
    println!("  Metal: compiled, {}", device_status(candle_core::Device::new_metal(0).is_ok()));
    #[cfg(not(feature = "metal"))]
    println!("  Metal: not compiled");

    #[cfg(feature = "accelerate")]
    println!("  Accelerate: compiled");
    #[cfg(not(feature = "accelerate"))]
    println!("  Accelerate: not compiled");

    println!("  CPU: {} threads", num_cpus::get());
    println!();
    println!("Usage:");
    println!("  visiontrain train -c config.yaml -r report.json");
    println!("  visiontrain train --synthetic --device cpu --precision fp32 --epochs 2");
    println!("  visiontrain config -f config.yaml  # Validate configuration");
    println!("  visiontrain info                   # Show this information");
}

#[cfg(any(feature = "cuda", feature = "metal"))]
fn device_status(available: bool) -> &'static str {
    if available {
        "available"
    } else {
        "unavailable"
    }
}
