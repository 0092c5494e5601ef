//! Single optimization step
//!
//! One step runs forward, loss, scaled backward, the warmup-gated clip, the
//! scaler-gated optimizer update and the schedule advance, in that order.

use candle_core::{DType, Tensor, Var};
use candle_nn::loss::cross_entropy;
use candle_nn::{ModuleT, VarMap};
use tracing::debug;

use crate::error::Result;
use crate::training::config::TrainingConfig;
use crate::training::data::Batch;
use crate::training::optimizers::{
    create_optimizer, create_scheduler, GradientClipper, OptimizerState, SchedulerState,
};
use crate::training::precision::GradScaler;

/// Result of one optimization step
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Unscaled batch loss
    pub loss: f64,
    /// Detached fp32 logits, `(batch, classes)`
    pub logits: Tensor,
    /// Whether the optimizer update ran
    pub applied: bool,
    /// Learning rate the step ran with
    pub learning_rate: f64,
    /// Gradient norm before clipping, when clipping ran
    pub grad_norm: Option<f64>,
    /// Loss scale after the step
    pub scale: f64,
}

/// Runs optimization steps and owns the schedule, scaler and optimizer state
pub struct StepExecutor {
    vars: Vec<Var>,
    optimizer: OptimizerState,
    scheduler: SchedulerState,
    scaler: GradScaler,
    clipper: GradientClipper,
    compute_dtype: DType,
    advance_on_skip: bool,
    /// Attempted steps, skipped ones included
    global_step: usize,
}

impl StepExecutor {
    pub fn new(
        vars: Vec<Var>,
        optimizer: OptimizerState,
        scheduler: SchedulerState,
        scaler: GradScaler,
        clipper: GradientClipper,
        compute_dtype: DType,
        advance_on_skip: bool,
    ) -> Self {
        Self {
            vars,
            optimizer,
            scheduler,
            scaler,
            clipper,
            compute_dtype,
            advance_on_skip,
            global_step: 0,
        }
    }

    /// Build the executor for a run of `steps_per_epoch * num_epochs` steps
    pub fn from_config(config: &TrainingConfig, var_map: &VarMap, steps_per_epoch: usize) -> Result<Self> {
        let total_steps = config.total_steps(steps_per_epoch);
        let warmup_steps = config.warmup_steps(total_steps);
        let vars = var_map.all_vars();

        let optimizer = create_optimizer(&config.optimizer, vars.clone())?;
        let scheduler = create_scheduler(&config.optimizer, total_steps, warmup_steps)?;
        let scaler = GradScaler::new(
            &config.mixed_precision.loss_scaling,
            config.loss_scaling_active(),
        );
        let clipper = GradientClipper::new(&config.optimizer.gradient_clipping, warmup_steps);

        debug!(
            "Step executor: {} params, {} total steps, {} warmup, optimizer {}",
            vars.len(),
            total_steps,
            warmup_steps,
            optimizer.name()
        );

        Ok(Self::new(
            vars,
            optimizer,
            scheduler,
            scaler,
            clipper,
            config.compute_dtype(),
            config.optimizer.scheduler.advance_on_skip,
        ))
    }

    /// Run one optimization step on `batch`
    pub fn step<M: ModuleT>(&mut self, model: &M, batch: &Batch, epoch: usize) -> Result<StepOutcome> {
        // The model casts to its compute dtype per layer; the loss runs in fp32
        let logits = model.forward_t(&batch.images, true)?.to_dtype(DType::F32)?;
        let loss = cross_entropy(&logits, &batch.labels)?;

        // Reading the loss waits for the device
        let loss_value = loss.to_scalar::<f32>()? as f64;

        let mut grads = self.scaler.scale(&loss)?.backward()?;
        let learning_rate = self.scheduler.apply(&mut self.optimizer);

        let mut grad_norm = None;
        if self.clipper.is_active(epoch, self.global_step)
            && !self.scaler.unscale(&self.vars, &mut grads)?
        {
            grad_norm = self
                .clipper
                .maybe_clip(&self.vars, &mut grads, epoch, self.global_step)?;
        }

        let applied = self
            .scaler
            .step(&mut self.optimizer, &self.vars, &mut grads)?
            .is_applied();
        self.scaler.update();

        if applied || self.advance_on_skip {
            self.scheduler.advance(&mut self.optimizer);
        }
        self.global_step += 1;

        Ok(StepOutcome {
            loss: loss_value,
            logits: logits.detach(),
            applied,
            learning_rate,
            grad_norm,
            scale: self.scaler.get_scale(),
        })
    }

    /// Attempted steps so far
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Learning rate for the next step
    pub fn current_lr(&self) -> f64 {
        self.scheduler.current_lr()
    }

    /// Schedule steps consumed
    pub fn scheduler_steps(&self) -> usize {
        self.scheduler.step_count()
    }

    /// Optimizer updates actually applied
    pub fn applied_steps(&self) -> usize {
        self.optimizer.step_count()
    }

    /// Steps skipped for non-finite gradients
    pub fn skipped_steps(&self) -> usize {
        self.scaler.skipped_steps()
    }

    /// Current loss scale
    pub fn loss_scale(&self) -> f64 {
        self.scaler.get_scale()
    }

    /// Dtype the model is configured to compute in
    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    /// Number of trainable scalars
    pub fn parameter_count(&self) -> usize {
        self.vars.iter().map(|v| v.elem_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::autocast::linear_forward;
    use crate::training::config::{LossScalingConfig, OptimizerType, PrecisionType};
    use approx::assert_relative_eq;
    use candle_core::Device;
    use candle_nn::{linear, Linear, VarBuilder};

    struct TinyModel {
        layer: Linear,
        dtype: DType,
    }

    impl ModuleT for TinyModel {
        fn forward_t(&self, xs: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
            linear_forward(&self.layer, &xs.flatten_from(1)?, self.dtype)
        }
    }

    fn fp32_config() -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.mixed_precision.precision = PrecisionType::FP32;
        config.training.num_epochs = 2;
        config.optimizer.optimizer_type = OptimizerType::Sgd {
            momentum: 0.0,
            nesterov: false,
        };
        config.optimizer.scheduler.warmup_steps = Some(5);
        config
    }

    fn setup() -> (VarMap, TinyModel, Batch) {
        setup_with(DType::F32)
    }

    fn setup_with(compute_dtype: DType) -> (VarMap, TinyModel, Batch) {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let model = TinyModel {
            layer: linear(4, 3, vb).unwrap(),
            dtype: compute_dtype,
        };
        let batch = Batch {
            images: Tensor::randn(0f32, 1.0, (6, 1, 2, 2), &device).unwrap(),
            labels: Tensor::new(&[0u32, 1, 2, 0, 1, 2], &device).unwrap(),
        };
        (var_map, model, batch)
    }

    #[test]
    fn test_schedule_follows_steps() {
        let config = fp32_config();
        let (var_map, model, batch) = setup();
        let mut executor = StepExecutor::from_config(&config, &var_map, 10).unwrap();

        let mut rates = Vec::new();
        for step in 0..20 {
            let outcome = executor.step(&model, &batch, step / 10).unwrap();
            assert!(outcome.applied);
            rates.push(outcome.learning_rate);
        }

        assert_relative_eq!(rates[4], 0.08, epsilon = 1e-12);
        assert!(rates[19] < 0.002);
        assert_eq!(executor.global_step(), 20);
        assert_eq!(executor.applied_steps(), 20);
        assert_eq!(executor.scheduler_steps(), 20);
    }

    #[test]
    fn test_clip_reports_norm_after_warmup() {
        let config = fp32_config();
        let (var_map, model, batch) = setup();
        let mut executor = StepExecutor::from_config(&config, &var_map, 10).unwrap();

        for step in 0..6 {
            let outcome = executor.step(&model, &batch, 0).unwrap();
            assert_eq!(outcome.grad_norm.is_some(), step >= 5, "step {}", step);
        }
    }

    #[test]
    fn test_skipped_step_leaves_parameters() {
        let mut config = fp32_config();
        config.optimizer.scheduler.advance_on_skip = false;
        let (var_map, model, mut batch) = setup();
        let mut executor = StepExecutor::from_config(&config, &var_map, 10).unwrap();

        let before: Vec<Vec<f32>> = var_map
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();

        batch.images = Tensor::full(f32::NAN, (6, 1, 2, 2), &Device::Cpu).unwrap();
        let outcome = executor.step(&model, &batch, 0).unwrap();

        let after: Vec<Vec<f32>> = var_map
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();

        assert!(!outcome.applied);
        assert_eq!(before, after);
        assert_eq!(executor.skipped_steps(), 1);
        assert_eq!(executor.scheduler_steps(), 0);
        assert_eq!(executor.global_step(), 1);
    }

    #[test]
    fn test_loss_scaling_is_transparent() {
        // Same update with and without a large loss scale
        let config = fp32_config();
        let (var_map, model, batch) = setup();
        let initial: Vec<Tensor> = var_map.all_vars().iter().map(|v| v.as_tensor().copy().unwrap()).collect();

        let mut executor = StepExecutor::from_config(&config, &var_map, 10).unwrap();
        executor.scaler = GradScaler::new(
            &LossScalingConfig {
                init_scale: 1024.0,
                ..Default::default()
            },
            true,
        );
        executor.step(&model, &batch, 0).unwrap();
        let with_scale: Vec<Vec<f32>> = var_map
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();

        for (var, init) in var_map.all_vars().iter().zip(&initial) {
            var.set(init).unwrap();
        }
        let mut plain = StepExecutor::from_config(&config, &var_map, 10).unwrap();
        plain.step(&model, &batch, 0).unwrap();
        let without_scale: Vec<Vec<f32>> = var_map
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();

        for (a, b) in with_scale.iter().flatten().zip(without_scale.iter().flatten()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_fp16_steps_with_dynamic_scaling() {
        let mut config = fp32_config();
        config.mixed_precision.precision = PrecisionType::FP16;
        assert!(config.loss_scaling_active());

        let (var_map, model, batch) = setup_with(config.compute_dtype());
        let mut executor = StepExecutor::from_config(&config, &var_map, 10).unwrap();
        assert_eq!(executor.compute_dtype(), DType::F16);
        assert_relative_eq!(executor.loss_scale(), 65536.0);

        for _ in 0..20 {
            let outcome = executor.step(&model, &batch, 0).unwrap();
            assert_eq!(outcome.logits.dtype(), DType::F32);
            assert!(outcome.loss.is_finite());
        }

        assert_eq!(executor.global_step(), 20);
        assert!(executor.applied_steps() > 0);
        assert_eq!(executor.applied_steps() + executor.skipped_steps(), 20);
        assert!(executor.loss_scale() >= 1.0);
        for var in var_map.all_vars() {
            assert_eq!(var.dtype(), DType::F32);
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(values.iter().all(|v| v.is_finite()));
        }
    }
}
