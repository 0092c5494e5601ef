//! Image classifier models
//!
//! The trainer only needs a [`candle_nn::ModuleT`] mapping an image batch to
//! per-class scores. Models here are split into a feature backbone and a
//! classification head so backbones can be swapped freely.

pub mod autocast;
pub mod backbone;
pub mod head;

pub use backbone::{Backbone, ConvBackbone};
pub use head::ClassifierHead;

use candle_core::{DType, Tensor};
use candle_nn::{ModuleT, VarBuilder};

use crate::error::Result;
use crate::training::config::ModelConfig;

/// Backbone followed by a classification head
pub struct ImageClassifier<B: Backbone> {
    backbone: B,
    head: ClassifierHead,
}

impl<B: Backbone> ImageClassifier<B> {
    /// Attach a freshly initialised head to `backbone`
    pub fn new(backbone: B, config: &ModelConfig, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        let head = ClassifierHead::new(
            backbone.feature_dim(),
            config.hidden_dim,
            config.num_classes,
            config.dropout as f32,
            compute_dtype,
            vb.pp("head"),
        )?;
        Ok(Self { backbone, head })
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }
}

impl<B: Backbone> ModuleT for ImageClassifier<B> {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let features = self.backbone.forward_t(xs, train)?.flatten_from(1)?;
        self.head.forward_t(&features, train)
    }
}

/// Build the default convolutional classifier described by `config`
///
/// `vb` should hold fp32 parameters; `compute_dtype` only affects the
/// forward pass.
pub fn build_classifier(
    config: &ModelConfig,
    compute_dtype: DType,
    vb: VarBuilder,
) -> Result<ImageClassifier<ConvBackbone>> {
    let backbone = ConvBackbone::new(
        config.in_channels,
        &config.backbone_widths,
        config.feature_dim,
        compute_dtype,
        vb.pp("backbone"),
    )?;
    ImageClassifier::new(backbone, config, compute_dtype, vb)
}
