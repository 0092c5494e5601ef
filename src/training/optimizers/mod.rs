//! Optimizers and learning rate schedulers for classifier training
//!
//! This module provides the optimization infrastructure: SGD and AdamW with
//! fp32 master weights, the warmup + cosine learning rate schedule and
//! warmup-gated gradient clipping.

pub mod adamw;
pub mod clipping;
pub mod schedulers;
pub mod sgd;
pub mod state;

pub use adamw::AdamWOptimizer;
pub use clipping::{clip_grad_norm, global_grad_norm, GradientClipper};
pub use schedulers::WarmupCosineScheduler;
pub use sgd::SGDOptimizer;
pub use state::MasterParameter;

use candle_core::backprop::GradStore;
use candle_core::Var;

use crate::error::Result;
use crate::training::config::{OptimizerConfig, OptimizerType};

/// Trait for optimizers
pub trait Optimizer: Send {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Perform optimization step
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Get parameter count
    fn parameter_count(&self) -> usize;

    /// Get current step count
    fn step_count(&self) -> usize;
}

/// Trait for learning rate schedulers
pub trait Scheduler: Send {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Learning rate for the next optimization step
    fn current_lr(&self) -> f64;

    /// Consume one step of the schedule, returning its learning rate
    fn advance(&mut self) -> f64;

    /// Steps consumed so far
    fn step_count(&self) -> usize;

    /// Check if scheduler is done (for finite schedules)
    fn is_done(&self) -> bool {
        false
    }

    /// Reset scheduler to initial state
    fn reset(&mut self);
}

/// Wrapper for optimizer state management
pub struct OptimizerState {
    optimizer: Box<dyn Optimizer>,
}

/// Wrapper for scheduler state management
///
/// The scheduler is the only writer of the optimizer's learning rate.
pub struct SchedulerState {
    scheduler: Box<dyn Scheduler>,
}

impl OptimizerState {
    /// Create new optimizer state
    pub fn new(optimizer: Box<dyn Optimizer>) -> Self {
        Self { optimizer }
    }

    /// Perform optimization step
    pub fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.optimizer.step(gradients)
    }

    /// Get current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Optimizer name
    pub fn name(&self) -> &str {
        self.optimizer.name()
    }

    /// Steps actually applied
    pub fn step_count(&self) -> usize {
        self.optimizer.step_count()
    }

    /// Get parameter count
    pub fn parameter_count(&self) -> usize {
        self.optimizer.parameter_count()
    }

    fn optimizer_mut(&mut self) -> &mut dyn Optimizer {
        self.optimizer.as_mut()
    }
}

impl SchedulerState {
    /// Create new scheduler state
    pub fn new(scheduler: Box<dyn Scheduler>) -> Self {
        Self { scheduler }
    }

    /// Write the rate for the upcoming step into the optimizer
    pub fn apply(&self, optimizer: &mut OptimizerState) -> f64 {
        let lr = self.scheduler.current_lr();
        optimizer.optimizer_mut().set_learning_rate(lr);
        lr
    }

    /// Advance one step and load the following rate into the optimizer
    ///
    /// Returns the rate of the step that was just consumed.
    pub fn advance(&mut self, optimizer: &mut OptimizerState) -> f64 {
        let lr = self.scheduler.advance();
        optimizer
            .optimizer_mut()
            .set_learning_rate(self.scheduler.current_lr());
        lr
    }

    /// Learning rate for the next optimization step
    pub fn current_lr(&self) -> f64 {
        self.scheduler.current_lr()
    }

    /// Steps consumed so far
    pub fn step_count(&self) -> usize {
        self.scheduler.step_count()
    }

    /// Check if scheduler is done
    pub fn is_done(&self) -> bool {
        self.scheduler.is_done()
    }

    /// Scheduler name
    pub fn name(&self) -> &str {
        self.scheduler.name()
    }
}

/// Create optimizer from configuration
pub fn create_optimizer(config: &OptimizerConfig, vars: Vec<Var>) -> Result<OptimizerState> {
    let optimizer: Box<dyn Optimizer> = match &config.optimizer_type {
        OptimizerType::Sgd { momentum, nesterov } => Box::new(SGDOptimizer::new(
            vars,
            config.learning_rate,
            *momentum,
            *nesterov,
            config.weight_decay,
        )?),
        OptimizerType::AdamW {
            beta1,
            beta2,
            epsilon,
        } => Box::new(AdamWOptimizer::new(
            vars,
            config.learning_rate,
            *beta1,
            *beta2,
            *epsilon,
            config.weight_decay,
        )?),
    };

    Ok(OptimizerState::new(optimizer))
}

/// Create the warmup + cosine scheduler for a run of `total_steps`
pub fn create_scheduler(
    config: &OptimizerConfig,
    total_steps: usize,
    warmup_steps: usize,
) -> Result<SchedulerState> {
    let scheduler = WarmupCosineScheduler::new(config.learning_rate, total_steps, warmup_steps)?;
    Ok(SchedulerState::new(Box::new(scheduler)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    #[test]
    fn test_create_optimizer_from_config() {
        let var = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let config = OptimizerConfig::default();
        let optimizer = create_optimizer(&config, vec![var.clone()]).unwrap();
        assert_eq!(optimizer.name(), "sgd_nesterov");
        assert_eq!(optimizer.parameter_count(), 1);

        let config = OptimizerConfig {
            optimizer_type: OptimizerType::AdamW {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            },
            ..Default::default()
        };
        let optimizer = create_optimizer(&config, vec![var]).unwrap();
        assert_eq!(optimizer.name(), "adamw");
    }

    #[test]
    fn test_scheduler_writes_optimizer_rate() {
        let var = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let config = OptimizerConfig::default();
        let mut optimizer = create_optimizer(&config, vec![var]).unwrap();
        let mut scheduler = create_scheduler(&config, 20, 5).unwrap();

        let lr = scheduler.apply(&mut optimizer);
        assert_relative_eq!(lr, 0.016, epsilon = 1e-12);
        assert_relative_eq!(optimizer.learning_rate(), 0.016, epsilon = 1e-12);

        let consumed = scheduler.advance(&mut optimizer);
        assert_relative_eq!(consumed, 0.016, epsilon = 1e-12);
        assert_relative_eq!(optimizer.learning_rate(), 0.032, epsilon = 1e-12);
        assert_eq!(scheduler.step_count(), 1);
    }

    #[test]
    fn test_create_scheduler_rejects_degenerate_schedule() {
        let config = OptimizerConfig::default();
        assert!(create_scheduler(&config, 0, 0).is_err());
        assert!(create_scheduler(&config, 10, 10).is_err());
    }
}
