//! # Input Stem
//!
//! The stem reduces the image by 4x before the residual stages:
//!
//! ```text
//! zero-pad 3, 7x7 conv stride 2 -> 64, norm, relu    ("conv1", "bn_conv1")
//! 3x3 max pool stride 2, no padding
//! ```
//!
//! The zero-padding step is folded into the convolution's explicit padding.

use crate::compat::conv_shape::maybe_conv2d_output_resolution;
use crate::compat::normalization_wrapper::NormalizationConfig;
use crate::errors::{self, FrcnnError};
use crate::layers::blocks::cna::{CNA2d, CNA2dConfig, CNA2dMeta};
use crate::models::resnet::naming::{LayerSummary, apply_trainable};
use crate::models::resnet::util::CONV_INTO_RELU_INITIALIZER;
use bimm_contracts::unpack_shape_contract;
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::Conv2dConfig;
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Initializer, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};

/// Stem convolution name.
pub const STEM_CONV_NAME: &str = "conv1";

/// Stem normalization name.
pub const STEM_NORM_NAME: &str = "bn_conv1";

/// [`ResNetStem`] Config.
#[derive(Config, Debug)]
pub struct ResNetStemConfig {
    /// Image channels.
    #[config(default = 3)]
    pub in_channels: usize,

    /// Stem convolution channels.
    #[config(default = 64)]
    pub out_channels: usize,

    /// Stem convolution kernel size.
    #[config(default = 7)]
    pub kernel_size: usize,

    /// Zero padding on each spatial edge.
    #[config(default = 3)]
    pub padding: usize,

    /// Stem convolution stride.
    #[config(default = 2)]
    pub stride: usize,

    /// Max pool window size.
    #[config(default = 3)]
    pub pool_size: usize,

    /// Max pool stride.
    #[config(default = 2)]
    pub pool_stride: usize,

    /// Whether the external optimizer may update the stem.
    #[config(default = true)]
    pub trainable: bool,

    /// Stem normalization.
    #[config(default = "NormalizationConfig::default()")]
    pub normalization: NormalizationConfig,

    /// Stem convolution initializer.
    #[config(default = "CONV_INTO_RELU_INITIALIZER")]
    pub initializer: Initializer,
}

impl ResNetStemConfig {
    /// Predict the stem output resolution.
    ///
    /// # Returns
    ///
    /// ``[out_height, out_width]``; or `None` if the image is too small,
    /// or the config is invalid.
    pub fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> Option<[usize; 2]> {
        self.try_validate().ok()?;
        let conv = maybe_conv2d_output_resolution(
            input_resolution,
            self.kernel_size,
            self.stride,
            self.padding,
        )?;
        maybe_conv2d_output_resolution(conv, self.pool_size, self.pool_stride, 0)
    }

    /// Check if the config is valid.
    ///
    /// Channels, kernel, stride and the pool window must be positive;
    /// the normalization must fit the stem channels.
    pub fn try_validate(&self) -> errors::Result<()> {
        let fields = [
            ("in_channels", self.in_channels),
            ("out_channels", self.out_channels),
            ("kernel_size", self.kernel_size),
            ("stride", self.stride),
            ("pool_size", self.pool_size),
            ("pool_stride", self.pool_stride),
        ];
        if let Some((field, _)) = fields.iter().find(|(_, value)| *value == 0) {
            return Err(FrcnnError::InvalidConfig {
                layer: STEM_CONV_NAME.to_string(),
                message: format!("{field} must be positive"),
            });
        }
        if !self.normalization.supports_num_features(self.out_channels) {
            return Err(FrcnnError::InvalidConfig {
                layer: STEM_NORM_NAME.to_string(),
                message: format!(
                    "{:?} cannot normalize {} channels",
                    self.normalization, self.out_channels
                ),
            });
        }
        Ok(())
    }

    /// Initialize a [`ResNetStem`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> errors::Result<ResNetStem<B>> {
        self.try_validate()?;
        Ok(self.build(device))
    }

    /// Initialize a [`ResNetStem`].
    ///
    /// # Panics
    ///
    /// If the config is invalid.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResNetStem<B> {
        match self.try_init(device) {
            Ok(stem) => stem,
            Err(err) => panic!("{err}"),
        }
    }

    fn build<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResNetStem<B> {
        let cna = CNA2dConfig::new(
            Conv2dConfig::new(
                [self.in_channels, self.out_channels],
                [self.kernel_size, self.kernel_size],
            )
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
            .with_initializer(self.initializer.clone()),
            self.normalization.clone(),
        );

        let stem = ResNetStem {
            trainable: self.trainable,
            cna: cna.init(device),
            pool: MaxPool2dConfig::new([self.pool_size, self.pool_size])
                .with_strides([self.pool_stride, self.pool_stride])
                .with_padding(PaddingConfig2d::Valid)
                .init(),
        };
        apply_trainable(stem, self.trainable)
    }
}

/// The stem module.
#[derive(Module, Debug)]
pub struct ResNetStem<B: Backend> {
    /// Trainability metadata.
    pub trainable: bool,

    /// The stem conv/norm/relu.
    pub cna: CNA2d<B>,

    /// The stem pooling.
    pub pool: MaxPool2d,
}

impl<B: Backend> ResNetStem<B> {
    /// The number of output channels.
    pub fn out_channels(&self) -> usize {
        self.cna.out_channels()
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, height, width]``.
    ///
    /// # Returns
    ///
    /// ``[batch, out_channels, out_height, out_width]``
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        unpack_shape_contract!(
            ["batch", "in_channels", "height", "width"],
            &input,
            &["batch"],
            &[("in_channels", self.cna.in_channels())]
        );
        let x = self.cna.forward(input);
        self.pool.forward(x)
    }

    /// The named layers of the stem.
    pub fn layer_summaries(&self) -> Vec<LayerSummary> {
        vec![
            LayerSummary::of::<B, _>(STEM_CONV_NAME, &self.cna.conv, self.trainable),
            LayerSummary::of::<B, _>(STEM_NORM_NAME, &self.cna.norm, self.trainable),
        ]
    }
}
