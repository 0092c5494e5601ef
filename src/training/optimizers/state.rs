//! Parameter state shared by the optimizers
//!
//! Each trainable variable is paired with an fp32 master copy. Updates are
//! computed against the master copy and written back in the variable's own
//! dtype, so fp16/bf16 parameters do not lose small updates to rounding.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};

use crate::error::Result;

/// A trainable variable with its fp32 master copy
pub struct MasterParameter {
    var: Var,
    master: Tensor,
}

impl MasterParameter {
    /// Capture the current value of `var` as the master copy
    pub fn new(var: Var) -> Result<Self> {
        let master = var.as_tensor().to_dtype(DType::F32)?.copy()?.detach();
        Ok(Self { var, master })
    }

    /// The live variable
    pub fn var(&self) -> &Var {
        &self.var
    }

    /// The fp32 master copy
    pub fn master(&self) -> &Tensor {
        &self.master
    }

    /// Gradient for this parameter as an untracked fp32 tensor
    pub fn gradient(&self, gradients: &GradStore) -> Result<Option<Tensor>> {
        match gradients.get(self.var.as_tensor()) {
            Some(grad) => Ok(Some(grad.detach().to_dtype(DType::F32)?)),
            None => Ok(None),
        }
    }

    /// Replace the master copy and write it back into the variable
    pub fn commit(&mut self, updated: Tensor) -> Result<()> {
        let value = updated.to_dtype(self.var.dtype())?;
        self.var.set(&value)?;
        self.master = updated.detach();
        Ok(())
    }
}

/// Wrap every variable in a master parameter
pub fn master_parameters(vars: Vec<Var>) -> Result<Vec<MasterParameter>> {
    vars.into_iter().map(MasterParameter::new).collect()
}
