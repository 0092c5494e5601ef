//! AdamW optimizer implementation
//!
//! This module provides the AdamW optimizer with decoupled weight decay.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::error::Result;

use super::state::{master_parameters, MasterParameter};
use super::Optimizer;

/// AdamW optimizer with decoupled weight decay
pub struct AdamWOptimizer {
    /// Parameters with their fp32 master copies
    params: Vec<MasterParameter>,

    /// Learning rate
    learning_rate: f64,

    /// Beta1 parameter (momentum)
    beta1: f64,

    /// Beta2 parameter (RMSprop)
    beta2: f64,

    /// Epsilon for numerical stability
    epsilon: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// First and second moment estimates, one slot per parameter
    moments: Vec<Option<(Tensor, Tensor)>>,
}

impl AdamWOptimizer {
    /// Create a new AdamW optimizer
    pub fn new(
        vars: Vec<Var>,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        weight_decay: f64,
    ) -> Result<Self> {
        let params = master_parameters(vars)?;
        let moments = vec![None; params.len()];

        Ok(Self {
            params,
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            step_count: 0,
            moments,
        })
    }

    /// Apply AdamW update to a parameter
    fn update_parameter(&mut self, index: usize, grad: Tensor) -> Result<()> {
        let param = self.params[index].master().clone();

        let (momentum, variance) = match self.moments[index].take() {
            Some(moments) => moments,
            None => (grad.zeros_like()?, grad.zeros_like()?),
        };

        // m_t = β₁ * m_{t-1} + (1 - β₁) * g_t
        let momentum = momentum
            .affine(self.beta1, 0.0)?
            .add(&grad.affine(1.0 - self.beta1, 0.0)?)?;

        // v_t = β₂ * v_{t-1} + (1 - β₂) * g_t²
        let variance = variance
            .affine(self.beta2, 0.0)?
            .add(&grad.sqr()?.affine(1.0 - self.beta2, 0.0)?)?;

        // Bias correction
        let bias_correction1 = 1.0 - self.beta1.powi(self.step_count as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.step_count as i32);

        let corrected_momentum = momentum.affine(1.0 / bias_correction1, 0.0)?;
        let denominator = variance
            .affine(1.0 / bias_correction2, 0.0)?
            .sqrt()?
            .affine(1.0, self.epsilon)?;
        let update = corrected_momentum.div(&denominator)?;

        // θ_t = θ_{t-1} * (1 - αλ) - α * m̂_t / (√v̂_t + ε)
        let decayed = param.affine(1.0 - self.learning_rate * self.weight_decay, 0.0)?;
        let updated = decayed.sub(&update.affine(self.learning_rate, 0.0)?)?;

        self.moments[index] = Some((momentum, variance));
        self.params[index].commit(updated)
    }
}

impl Optimizer for AdamWOptimizer {
    fn name(&self) -> &str {
        "adamw"
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;

        for index in 0..self.params.len() {
            if let Some(grad) = self.params[index].gradient(gradients)? {
                self.update_parameter(index, grad)?;
            }
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
