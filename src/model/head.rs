//! Classification head
//!
//! Two hidden blocks of Linear, BatchNorm, ReLU6 with dropout after the
//! first block, followed by the output projection.

use candle_core::{DType, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, BatchNormConfig, Dropout, Linear, ModuleT, VarBuilder};

use super::autocast::linear_forward;
use crate::error::Result;

/// ReLU clipped at 6
pub(crate) fn relu6(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.clamp(0f32, 6f32)
}

/// MLP head mapping backbone features to class scores
pub struct ClassifierHead {
    fc1: Linear,
    bn1: BatchNorm,
    dropout: Dropout,
    fc2: Linear,
    bn2: BatchNorm,
    classifier: Linear,
    num_classes: usize,
    compute_dtype: DType,
}

impl ClassifierHead {
    pub fn new(
        in_dim: usize,
        hidden_dim: usize,
        num_classes: usize,
        dropout: f32,
        compute_dtype: DType,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            fc1: linear(in_dim, hidden_dim, vb.pp("fc1"))?,
            bn1: batch_norm(hidden_dim, BatchNormConfig::default(), vb.pp("bn1"))?,
            dropout: Dropout::new(dropout),
            fc2: linear(hidden_dim, hidden_dim, vb.pp("fc2"))?,
            bn2: batch_norm(hidden_dim, BatchNormConfig::default(), vb.pp("bn2"))?,
            classifier: linear(hidden_dim, num_classes, vb.pp("classifier"))?,
            num_classes,
            compute_dtype,
        })
    }

    /// Number of output classes
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl ModuleT for ClassifierHead {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let dtype = self.compute_dtype;
        let xs = linear_forward(&self.fc1, xs, dtype)?.to_dtype(DType::F32)?;
        let xs = relu6(&self.bn1.forward_t(&xs, train)?)?;
        let xs = self.dropout.forward_t(&xs, train)?;
        let xs = linear_forward(&self.fc2, &xs, dtype)?.to_dtype(DType::F32)?;
        let xs = relu6(&self.bn2.forward_t(&xs, train)?)?;
        linear_forward(&self.classifier, &xs, dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_relu6_clamps() {
        let xs = Tensor::new(&[-1.0f32, 3.0, 9.0], &Device::Cpu).unwrap();
        assert_eq!(relu6(&xs).unwrap().to_vec1::<f32>().unwrap(), vec![0.0, 3.0, 6.0]);
    }

    #[test]
    fn test_head_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ClassifierHead::new(10, 6, 4, 0.0, DType::F32, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (3, 10), &Device::Cpu).unwrap();
        assert_eq!(head.forward_t(&xs, true).unwrap().dims(), &[3, 4]);
        assert_eq!(head.num_classes(), 4);
    }

    #[test]
    fn test_half_precision_head_keeps_fp32_batch_norm() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ClassifierHead::new(10, 6, 4, 0.1, DType::F16, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (3, 10), &Device::Cpu).unwrap();
        let logits = head.forward_t(&xs, true).unwrap();
        assert_eq!(logits.dtype(), DType::F16);
        assert_eq!(logits.dims(), &[3, 4]);
        assert!(varmap.all_vars().iter().all(|v| v.dtype() == DType::F32));
    }
}
