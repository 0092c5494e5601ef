//! Gradient clipping utilities
//!
//! Global-norm clipping plus the gate that keeps clipping switched off
//! while the learning rate is still warming up.

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use tracing::trace;

use crate::error::Result;
use crate::training::config::{ClipGateUnit, GradientClippingConfig};

/// Global L2 norm over every gradient present in `gradients`
pub fn global_grad_norm(vars: &[Var], gradients: &GradStore) -> Result<f64> {
    let mut global_norm_squared = 0.0f64;

    for var in vars {
        if let Some(grad) = gradients.get(var.as_tensor()) {
            let squared = grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f32>()?;
            global_norm_squared += squared as f64;
        }
    }

    Ok(global_norm_squared.sqrt())
}

/// Rescale all gradients so their global norm does not exceed `max_norm`
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(vars: &[Var], gradients: &mut GradStore, max_norm: f64) -> Result<f64> {
    let total_norm = global_grad_norm(vars, gradients)?;
    let coefficient = max_norm / (total_norm + 1e-6);

    if coefficient < 1.0 {
        for var in vars {
            if let Some(grad) = gradients.get(var.as_tensor()) {
                let clipped = grad.affine(coefficient, 0.0)?;
                gradients.insert(var.as_tensor(), clipped);
            }
        }
    }

    Ok(total_norm)
}

/// Decides when clipping is active and applies it
#[derive(Debug, Clone)]
pub struct GradientClipper {
    enabled: bool,
    max_norm: f64,
    unit: ClipGateUnit,
    warmup_steps: usize,
}

impl GradientClipper {
    /// Create a clipper gated on the end of a `warmup_steps` warmup
    pub fn new(config: &GradientClippingConfig, warmup_steps: usize) -> Self {
        Self {
            enabled: config.enabled,
            max_norm: config.max_norm,
            unit: config.gate,
            warmup_steps,
        }
    }

    /// Clipping threshold
    pub fn max_norm(&self) -> f64 {
        self.max_norm
    }

    /// Whether clipping applies at this point of the run
    ///
    /// With [`ClipGateUnit::Step`] the gate opens once `global_step` reaches
    /// the warmup length. [`ClipGateUnit::Epoch`] compares the epoch index
    /// against the warmup step count instead, which rarely opens on real runs.
    pub fn is_active(&self, epoch: usize, global_step: usize) -> bool {
        if !self.enabled {
            return false;
        }
        match self.unit {
            ClipGateUnit::Step => global_step >= self.warmup_steps,
            ClipGateUnit::Epoch => epoch > self.warmup_steps,
        }
    }

    /// Clip when the gate is open, returning the pre-clip norm if it was
    pub fn maybe_clip(
        &self,
        vars: &[Var],
        gradients: &mut GradStore,
        epoch: usize,
        global_step: usize,
    ) -> Result<Option<f64>> {
        if !self.is_active(epoch, global_step) {
            return Ok(None);
        }

        let norm = clip_grad_norm(vars, gradients, self.max_norm)?;
        trace!("clipped gradients: norm {:.4} max {:.4}", norm, self.max_norm);
        Ok(Some(norm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{Device, Tensor};

    fn setup() -> (Vec<Var>, GradStore) {
        let device = Device::Cpu;
        let a = Var::new(&[1.0f32, 1.0], &device).unwrap();
        let b = Var::new(&[1.0f32], &device).unwrap();
        // Gradients (3, 0) and (4): global norm 5
        let ca = Tensor::new(&[3.0f32, 0.0], &device).unwrap();
        let cb = Tensor::new(&[4.0f32], &device).unwrap();
        let loss = (a.as_tensor().mul(&ca).unwrap().sum_all().unwrap()
            + b.as_tensor().mul(&cb).unwrap().sum_all().unwrap())
        .unwrap();
        let grads = loss.backward().unwrap();
        (vec![a, b], grads)
    }

    #[test]
    fn test_global_norm() {
        let (vars, grads) = setup();
        assert_relative_eq!(global_grad_norm(&vars, &grads).unwrap(), 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let (vars, mut grads) = setup();
        let before = clip_grad_norm(&vars, &mut grads, 1.0).unwrap();
        assert_relative_eq!(before, 5.0, epsilon = 1e-6);
        assert_relative_eq!(global_grad_norm(&vars, &grads).unwrap(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_clip_leaves_small_gradients() {
        let (vars, mut grads) = setup();
        clip_grad_norm(&vars, &mut grads, 10.0).unwrap();
        assert_relative_eq!(global_grad_norm(&vars, &grads).unwrap(), 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_step_gate_opens_after_warmup() {
        let config = GradientClippingConfig::default();
        let clipper = GradientClipper::new(&config, 5);

        assert!(!clipper.is_active(0, 4));
        assert!(clipper.is_active(0, 5));
        assert!(clipper.is_active(3, 100));
    }

    #[test]
    fn test_epoch_gate_compares_epoch_index() {
        let config = GradientClippingConfig {
            gate: ClipGateUnit::Epoch,
            ..Default::default()
        };
        let clipper = GradientClipper::new(&config, 5);

        assert!(!clipper.is_active(5, 10_000));
        assert!(clipper.is_active(6, 0));
    }

    #[test]
    fn test_disabled_clipper_never_clips() {
        let config = GradientClippingConfig {
            enabled: false,
            ..Default::default()
        };
        let clipper = GradientClipper::new(&config, 0);
        let (vars, mut grads) = setup();

        assert!(clipper.maybe_clip(&vars, &mut grads, 10, 10).unwrap().is_none());
        assert_relative_eq!(global_grad_norm(&vars, &grads).unwrap(), 5.0, epsilon = 1e-6);
    }
}
