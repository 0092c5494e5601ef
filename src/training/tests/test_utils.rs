//! Test utilities and helper functions

use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use crate::model::{build_classifier, ConvBackbone, ImageClassifier};
use crate::training::config::{DeviceType, PrecisionType, TrainingConfig};
use crate::training::data::{DataLoader, DataLoaderConfig, Dataset};
use crate::training::metrics::EpochRecord;
use crate::training::session::TrainingSession;

/// Image shape used by the test model
pub const TEST_IMAGE_SHAPE: (usize, usize, usize) = (3, 8, 8);

/// Small CPU/fp32 configuration that trains in well under a second per epoch
pub fn create_test_config() -> TrainingConfig {
    let mut config = TrainingConfig::default();

    config.model.num_classes = 4;
    config.model.feature_dim = 16;
    config.model.hidden_dim = 16;
    config.model.dropout = 0.0;
    config.model.image_size = TEST_IMAGE_SHAPE.1;
    config.model.in_channels = TEST_IMAGE_SHAPE.0;
    config.model.backbone_widths = vec![8, 16];

    config.optimizer.learning_rate = 0.05;
    config.optimizer.scheduler.warmup_steps = Some(2);

    config.training.num_epochs = 3;
    config.training.batch_size = 8;
    config.training.log_steps = 1;

    config.data.num_workers = 2;
    config.data.prefetch_factor = 2;
    config.data.stall_timeout_secs = Some(30);

    config.mixed_precision.precision = PrecisionType::FP32;
    config.runtime.device = DeviceType::Cpu;

    config
}

/// Training and evaluation loaders on the CPU
pub fn create_test_loaders<T, V>(
    config: &TrainingConfig,
    train: T,
    val: V,
) -> (DataLoader<T>, DataLoader<V>)
where
    T: Dataset + 'static,
    V: Dataset + 'static,
{
    let train_loader = DataLoader::new(
        Arc::new(train),
        DataLoaderConfig::for_training(config),
        Device::Cpu,
    )
    .unwrap();
    let val_loader = DataLoader::new(
        Arc::new(val),
        DataLoaderConfig::for_evaluation(config),
        Device::Cpu,
    )
    .unwrap();
    (train_loader, val_loader)
}

/// Fresh classifier and session for `steps_per_epoch` batches
pub fn build_test_session(
    config: TrainingConfig,
    steps_per_epoch: usize,
) -> crate::error::Result<TrainingSession<ImageClassifier<ConvBackbone>>> {
    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
    let model = build_classifier(&config.model, config.compute_dtype(), vb)?;
    TrainingSession::new(config, model, &var_map, steps_per_epoch)
}

/// Accuracies are percentages with top-1 never above top-5
pub fn assert_record_valid(record: &EpochRecord) {
    assert!(record.loss.is_finite(), "loss {} is not finite", record.loss);
    assert!((0.0..=100.0).contains(&record.top1), "top1 {}", record.top1);
    assert!((0.0..=100.0).contains(&record.top5), "top5 {}", record.top5);
    assert!(record.top1 <= record.top5, "top1 {} > top5 {}", record.top1, record.top5);
}
