//! Dynamic loss scaling for mixed precision training
//!
//! The loss is multiplied by a scale factor before the backward pass so fp16
//! gradients stay above the underflow threshold. Gradients are divided back
//! out before the optimizer runs. A step whose unscaled gradients contain
//! inf or NaN is skipped entirely and the scale backs off; a run of finite
//! steps grows it again.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use tracing::{debug, warn};

use crate::error::Result;
use crate::training::config::LossScalingConfig;
use crate::training::optimizers::OptimizerState;

/// Outcome of one scaler-gated optimizer step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalerStep {
    /// Gradients were finite and the optimizer update ran
    Applied,
    /// Non-finite gradients, parameters left untouched
    Skipped,
}

impl ScalerStep {
    pub fn is_applied(&self) -> bool {
        matches!(self, ScalerStep::Applied)
    }
}

/// Dynamic loss scaler
#[derive(Debug, Clone)]
pub struct GradScaler {
    /// Current scale factor
    scale: f64,
    /// Factor to multiply scale by after a run of finite steps
    growth_factor: f64,
    /// Factor to multiply scale by when overflow is detected
    backoff_factor: f64,
    /// Finite steps required before growing the scale
    growth_interval: usize,
    /// Finite steps since the last growth or backoff
    growth_tracker: usize,
    /// Lower bound for the scale
    min_scale: f64,
    /// Whether the loss is actually scaled
    enabled: bool,
    /// Non-finite result of this step's unscale, `None` before unscaling
    found_inf: Option<bool>,
    /// Total skipped steps
    skipped_steps: usize,
    /// Skipped steps in a row
    consecutive_skips: usize,
    /// Consecutive skips that trigger a warning, 0 disables
    skip_warning_threshold: usize,
    /// Skip streak warnings emitted
    skip_warnings: usize,
}

impl GradScaler {
    /// Create a scaler from configuration
    ///
    /// A disabled scaler keeps the scale at 1 but still refuses to apply
    /// steps with non-finite gradients.
    pub fn new(config: &LossScalingConfig, enabled: bool) -> Self {
        Self {
            scale: if enabled { config.init_scale } else { 1.0 },
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval,
            growth_tracker: 0,
            min_scale: config.min_scale,
            enabled,
            found_inf: None,
            skipped_steps: 0,
            consecutive_skips: 0,
            skip_warning_threshold: config.skip_warning_threshold,
            skip_warnings: 0,
        }
    }

    /// Scaler that never rescales the loss
    pub fn disabled() -> Self {
        Self::new(&LossScalingConfig::default(), false)
    }

    /// Current scale factor
    pub fn get_scale(&self) -> f64 {
        self.scale
    }

    /// Whether the loss is actually scaled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Total steps skipped for non-finite gradients
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    /// Skipped steps in a row
    pub fn consecutive_skips(&self) -> usize {
        self.consecutive_skips
    }

    /// Skip streak warnings emitted so far
    pub fn skip_warnings(&self) -> usize {
        self.skip_warnings
    }

    /// Multiply the loss by the current scale
    pub fn scale(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        Ok(loss.affine(self.scale, 0.0)?)
    }

    /// Divide gradients by the scale in place, converting them to fp32
    ///
    /// Runs at most once per step. Returns `true` when any unscaled gradient
    /// is non-finite.
    pub fn unscale(&mut self, vars: &[Var], gradients: &mut GradStore) -> Result<bool> {
        if let Some(found_inf) = self.found_inf {
            return Ok(found_inf);
        }

        let inv_scale = 1.0 / self.scale;
        let mut found_inf = false;

        for var in vars {
            let Some(grad) = gradients.get(var.as_tensor()) else {
                continue;
            };
            let mut unscaled = grad.detach().to_dtype(DType::F32)?;
            if inv_scale != 1.0 {
                unscaled = unscaled.affine(inv_scale, 0.0)?;
            }
            if !found_inf && !all_finite(&unscaled)? {
                found_inf = true;
            }
            gradients.insert(var.as_tensor(), unscaled);
        }

        self.found_inf = Some(found_inf);
        Ok(found_inf)
    }

    /// Run the optimizer on unscaled gradients unless they overflowed
    pub fn step(
        &mut self,
        optimizer: &mut OptimizerState,
        vars: &[Var],
        gradients: &mut GradStore,
    ) -> Result<ScalerStep> {
        if self.unscale(vars, gradients)? {
            self.skipped_steps += 1;
            self.consecutive_skips += 1;
            debug!(
                "non-finite gradients at scale {}, skipping optimizer step",
                self.scale
            );
            if self.skip_warning_threshold > 0
                && self.consecutive_skips % self.skip_warning_threshold == 0
            {
                self.skip_warnings += 1;
                warn!(
                    "{} consecutive optimizer steps skipped for non-finite gradients (scale {})",
                    self.consecutive_skips, self.scale
                );
            }
            return Ok(ScalerStep::Skipped);
        }

        optimizer.step(gradients)?;
        self.consecutive_skips = 0;
        Ok(ScalerStep::Applied)
    }

    /// Commit the scale adjustment for the step that just ran
    pub fn update(&mut self) {
        let Some(found_inf) = self.found_inf.take() else {
            return;
        };
        if !self.enabled {
            return;
        }

        if found_inf {
            self.scale = (self.scale * self.backoff_factor).max(self.min_scale);
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
    }
}

/// `x - x` is zero for finite values and NaN for inf or NaN, so the sum is
/// exactly zero only when every element is finite
fn all_finite(tensor: &Tensor) -> Result<bool> {
    let residue = tensor.sub(tensor)?.sum_all()?.to_scalar::<f32>()?;
    Ok(residue == 0.0)
}
