//! Feature backbones

use candle_core::{DType, Tensor};
use candle_nn::{batch_norm, conv2d_no_bias, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, ModuleT, VarBuilder};

use super::autocast::conv2d_forward;
use super::head::relu6;
use crate::error::{Error, Result};

/// Anything that turns an image batch into a `(batch, feature_dim)` batch
pub trait Backbone: ModuleT + Send + Sync {
    /// Width of the produced feature vector
    fn feature_dim(&self) -> usize;
}

/// Conv, BatchNorm, ReLU6
struct ConvBlock {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBlock {
    fn new(in_channels: usize, out_channels: usize, kernel: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: kernel / 2,
            stride,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d_no_bias(in_channels, out_channels, kernel, config, vb.pp("conv"))?,
            bn: batch_norm(out_channels, BatchNormConfig::default(), vb.pp("bn"))?,
        })
    }

    fn forward_t(&self, xs: &Tensor, dtype: DType, train: bool) -> candle_core::Result<Tensor> {
        let xs = conv2d_forward(&self.conv, xs, dtype)?.to_dtype(DType::F32)?;
        relu6(&self.bn.forward_t(&xs, train)?)
    }
}

/// Strided 3x3 convolution stages, a 1x1 expansion to `feature_dim` and
/// global average pooling
pub struct ConvBackbone {
    stages: Vec<ConvBlock>,
    expand: ConvBlock,
    feature_dim: usize,
    compute_dtype: DType,
}

impl ConvBackbone {
    /// Convolutions run in `compute_dtype`, BatchNorm and pooling in fp32
    pub fn new(
        in_channels: usize,
        widths: &[usize],
        feature_dim: usize,
        compute_dtype: DType,
        vb: VarBuilder,
    ) -> Result<Self> {
        if widths.is_empty() {
            return Err(Error::config("Backbone needs at least one stage"));
        }

        let mut stages = Vec::with_capacity(widths.len());
        let mut channels = in_channels;
        for (i, &width) in widths.iter().enumerate() {
            stages.push(ConvBlock::new(channels, width, 3, 2, vb.pp(format!("stage{}", i)))?);
            channels = width;
        }
        let expand = ConvBlock::new(channels, feature_dim, 1, 1, vb.pp("expand"))?;

        Ok(Self {
            stages,
            expand,
            feature_dim,
            compute_dtype,
        })
    }
}

impl ModuleT for ConvBackbone {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for stage in &self.stages {
            xs = stage.forward_t(&xs, self.compute_dtype, train)?;
        }
        let xs = self.expand.forward_t(&xs, self.compute_dtype, train)?;
        // (batch, channels, h, w) -> (batch, channels)
        xs.mean((2, 3))
    }
}

impl Backbone for ConvBackbone {
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}
