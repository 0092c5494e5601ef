//! SGD optimizer implementation with momentum
//!
//! This module provides Stochastic Gradient Descent with optional heavy-ball
//! or Nesterov momentum and L2 weight decay folded into the gradient.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::error::Result;

use super::state::{master_parameters, MasterParameter};
use super::Optimizer;

/// SGD optimizer with momentum
pub struct SGDOptimizer {
    /// Parameters with their fp32 master copies
    params: Vec<MasterParameter>,

    /// Learning rate
    learning_rate: f64,

    /// Momentum coefficient
    momentum: f64,

    /// Use Nesterov momentum
    nesterov: bool,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// Momentum buffers, one slot per parameter
    momentum_buffers: Vec<Option<Tensor>>,
}

impl SGDOptimizer {
    /// Create a new SGD optimizer
    pub fn new(
        vars: Vec<Var>,
        learning_rate: f64,
        momentum: f64,
        nesterov: bool,
        weight_decay: f64,
    ) -> Result<Self> {
        let params = master_parameters(vars)?;
        let momentum_buffers = vec![None; params.len()];

        Ok(Self {
            params,
            learning_rate,
            momentum,
            nesterov,
            weight_decay,
            step_count: 0,
            momentum_buffers,
        })
    }

    /// Compute the descent direction for one parameter
    fn direction(&mut self, index: usize, param: &Tensor, grad: Tensor) -> Result<Tensor> {
        // Apply weight decay to gradient if specified
        let grad = if self.weight_decay > 0.0 {
            grad.add(&param.affine(self.weight_decay, 0.0)?)?
        } else {
            grad
        };

        if self.momentum <= 0.0 {
            return Ok(grad);
        }

        // First step seeds the buffer with the raw gradient: v_1 = g_1
        let buffer = match self.momentum_buffers[index].take() {
            Some(buffer) => buffer.affine(self.momentum, 0.0)?.add(&grad)?,
            None => grad.clone(),
        };
        let direction = if self.nesterov {
            grad.add(&buffer.affine(self.momentum, 0.0)?)?
        } else {
            buffer.clone()
        };
        self.momentum_buffers[index] = Some(buffer);

        Ok(direction)
    }
}

impl Optimizer for SGDOptimizer {
    fn name(&self) -> &str {
        match (self.momentum > 0.0, self.nesterov) {
            (false, _) => "sgd",
            (true, false) => "sgd_momentum",
            (true, true) => "sgd_nesterov",
        }
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;

        for index in 0..self.params.len() {
            let Some(grad) = self.params[index].gradient(gradients)? else {
                continue;
            };
            let master = self.params[index].master().clone();
            let direction = self.direction(index, &master, grad)?;

            // θ_t = θ_{t-1} - α * d_t
            let updated = master.sub(&direction.affine(self.learning_rate, 0.0)?)?;
            self.params[index].commit(updated)?;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn parameter_count(&self) -> usize {
        self.params.len()
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}
