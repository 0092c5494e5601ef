//! Mixed precision forward helpers
//!
//! Parameters stay in fp32. Matmul and convolution layers cast their input
//! and weights to the compute dtype for the forward pass, while BatchNorm
//! and everything numerically sensitive runs in fp32. Gradients flow back
//! through the casts into the fp32 parameters.

use candle_core::{DType, Tensor};
use candle_nn::{Conv2d, Linear, Module};

/// Apply `layer` in `dtype`
pub fn linear_forward(layer: &Linear, xs: &Tensor, dtype: DType) -> candle_core::Result<Tensor> {
    if layer.weight().dtype() == dtype {
        return layer.forward(&xs.to_dtype(dtype)?);
    }
    let weight = layer.weight().to_dtype(dtype)?;
    let bias = layer.bias().map(|b| b.to_dtype(dtype)).transpose()?;
    Linear::new(weight, bias).forward(&xs.to_dtype(dtype)?)
}

/// Apply `layer` in `dtype`
pub fn conv2d_forward(layer: &Conv2d, xs: &Tensor, dtype: DType) -> candle_core::Result<Tensor> {
    if layer.weight().dtype() == dtype {
        return layer.forward(&xs.to_dtype(dtype)?);
    }
    let config = layer.config();
    let ys = xs.to_dtype(dtype)?.conv2d(
        &layer.weight().to_dtype(dtype)?,
        config.padding,
        config.stride,
        config.dilation,
        config.groups,
    )?;
    match layer.bias() {
        None => Ok(ys),
        Some(bias) => {
            let bias = bias.to_dtype(dtype)?.reshape((1, (), 1, 1))?;
            ys.broadcast_add(&bias)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{conv2d_no_bias, linear, Conv2dConfig, VarBuilder, VarMap};

    #[test]
    fn test_linear_runs_in_compute_dtype() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = linear(4, 3, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 4), &Device::Cpu).unwrap();

        let half = linear_forward(&layer, &xs, DType::F16).unwrap();
        let full = linear_forward(&layer, &xs, DType::F32).unwrap();
        assert_eq!(half.dtype(), DType::F16);

        let half = half.to_dtype(DType::F32).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let full = full.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (h, f) in half.iter().zip(&full) {
            assert!((h - f).abs() < 1e-2, "{} vs {}", h, f);
        }
    }

    #[test]
    fn test_gradients_reach_fp32_weights() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let conv = conv2d_no_bias(2, 3, 3, Conv2dConfig { padding: 1, ..Default::default() }, vb.pp("conv")).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (1, 2, 4, 4), &Device::Cpu).unwrap();

        let ys = conv2d_forward(&conv, &xs, DType::F16).unwrap();
        assert_eq!(ys.dims(), &[1, 3, 4, 4]);
        let grads = ys.to_dtype(DType::F32).unwrap().sum_all().unwrap().backward().unwrap();

        let grad = grads.get(conv.weight()).unwrap();
        assert_eq!(grad.dtype(), DType::F32);
        assert_eq!(grad.dims(), conv.weight().dims());
    }
}
