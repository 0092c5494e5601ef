//! Learning rate schedulers for training optimization
//!
//! The run uses a per-step schedule: a linear warmup ramp up to the base
//! learning rate followed by half-cosine decay down to zero over the
//! remaining steps.

use std::f64::consts::PI;

use crate::error::{Error, Result};

use super::Scheduler;

/// Linear warmup followed by cosine decay, driven by a global step counter
#[derive(Debug, Clone)]
pub struct WarmupCosineScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Total training steps
    total_steps: usize,

    /// Warmup steps
    warmup_steps: usize,

    /// Optimization steps taken so far
    current_step: usize,
}

impl WarmupCosineScheduler {
    /// Create a new warmup + cosine scheduler
    ///
    /// Rejects `total_steps == 0` and `warmup_steps >= total_steps`, both of
    /// which leave the cosine phase without a single step.
    pub fn new(base_lr: f64, total_steps: usize, warmup_steps: usize) -> Result<Self> {
        if total_steps == 0 {
            return Err(Error::config("Scheduler total steps must be greater than 0"));
        }
        if warmup_steps >= total_steps {
            return Err(Error::config(format!(
                "Warmup steps ({}) must be smaller than total steps ({})",
                warmup_steps, total_steps
            )));
        }
        if !(base_lr > 0.0) || !base_lr.is_finite() {
            return Err(Error::config("Scheduler base learning rate must be positive"));
        }

        Ok(Self {
            base_lr,
            total_steps,
            warmup_steps,
            current_step: 0,
        })
    }

    /// Learning rate for an arbitrary step, without touching the counter
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }

        let decay_steps = (self.total_steps - self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).clamp(0.0, 1.0);
        self.base_lr * 0.5 * (1.0 + (PI * progress).cos())
    }

    /// Base learning rate
    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    /// Total training steps
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Warmup steps
    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}

impl Scheduler for WarmupCosineScheduler {
    fn name(&self) -> &str {
        "warmup_cosine"
    }

    fn current_lr(&self) -> f64 {
        self.lr_at(self.current_step)
    }

    fn advance(&mut self) -> f64 {
        let lr = self.lr_at(self.current_step);
        self.current_step += 1;
        lr
    }

    fn step_count(&self) -> usize {
        self.current_step
    }

    fn is_done(&self) -> bool {
        self.current_step >= self.total_steps
    }

    fn reset(&mut self) {
        self.current_step = 0;
    }
}
