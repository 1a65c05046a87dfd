//! # Projection Shortcut
//!
//! The learned shortcut of a projection unit: a strided 1x1 convolution
//! followed by normalization, mapping the unit input onto the main path's
//! output channels and resolution so the residual addition is shape-valid.

use crate::compat::conv_shape::stride_ceil_output_resolution;
use crate::compat::normalization_wrapper::{Normalization, NormalizationConfig};
use crate::models::resnet::util::CONV_INTO_RELU_INITIALIZER;
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Initializer, PaddingConfig2d};
use burn::prelude::{Backend, Config, Module, Tensor};

/// [`ProjectionShortcut`] Meta trait.
pub trait ProjectionShortcutMeta {
    /// The size of the in channels dimension.
    fn in_channels(&self) -> usize;

    /// The size of the out channels dimension.
    fn out_channels(&self) -> usize;

    /// The stride of the projection.
    fn stride(&self) -> usize;

    /// Get the output resolution for a given input resolution.
    ///
    /// # Returns
    ///
    /// ``[ceil(in_height / stride), ceil(in_width / stride)]``
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        stride_ceil_output_resolution(input_resolution, self.stride())
    }
}

/// [`ProjectionShortcut`] configuration.
#[derive(Config, Debug)]
pub struct ProjectionShortcutConfig {
    /// The size of the in channels dimension.
    pub in_channels: usize,

    /// The size of the out channels dimension.
    pub out_channels: usize,

    /// The stride of the projection.
    #[config(default = 2)]
    pub stride: usize,

    /// The [`Normalization`] config; feature size is auto-matched.
    #[config(default = "NormalizationConfig::default()")]
    pub normalization: NormalizationConfig,

    /// The conv initializer.
    #[config(default = "CONV_INTO_RELU_INITIALIZER")]
    pub initializer: Initializer,
}

impl ProjectionShortcutMeta for ProjectionShortcutConfig {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

impl ProjectionShortcutConfig {
    /// Initialize a [`ProjectionShortcut`] `Module`.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ProjectionShortcut<B> {
        ProjectionShortcut {
            conv: Conv2dConfig::new([self.in_channels, self.out_channels], [1, 1])
                .with_stride([self.stride, self.stride])
                .with_padding(PaddingConfig2d::Valid)
                .with_initializer(self.initializer.clone())
                .init(device),
            norm: self
                .normalization
                .clone()
                .with_num_features(self.out_channels)
                .init(device),
        }
    }
}

/// Strided 1x1 conv + norm shortcut.
///
/// Maps ``[batch, in_channels, in_height, in_width]`` to
/// ``[batch, out_channels, ceil(in_height / stride), ceil(in_width / stride)]``.
#[derive(Module, Debug)]
pub struct ProjectionShortcut<B: Backend> {
    /// The projection convolution.
    pub conv: Conv2d<B>,

    /// The projection normalization.
    pub norm: Normalization<B>,
}

impl<B: Backend> ProjectionShortcutMeta for ProjectionShortcut<B> {
    fn in_channels(&self) -> usize {
        self.conv.weight.shape().dims[1]
    }

    fn out_channels(&self) -> usize {
        self.conv.weight.shape().dims[0]
    }

    fn stride(&self) -> usize {
        self.conv.stride[0]
    }
}

impl<B: Backend> ProjectionShortcut<B> {
    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: a ``[batch, in_channels, in_height, in_width]`` tensor.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_channels, out_height, out_width]`` tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch, in_height, in_width] = unpack_shape_contract!(
            ["batch", "in_channels", "in_height", "in_width"],
            &input,
            &["batch", "in_height", "in_width"],
            &[("in_channels", self.in_channels())]
        );
        let [out_height, out_width] = self.output_resolution([in_height, in_width]);

        let out = self.conv.forward(input);
        let out = self.norm.forward(out);

        assert_shape_contract_periodically!(
            ["batch", "out_channels", "out_height", "out_width"],
            &out,
            &[
                ("batch", batch),
                ("out_channels", self.out_channels()),
                ("out_height", out_height),
                ("out_width", out_width)
            ]
        );

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::NdArray;

    #[test]
    fn test_shortcut_config() {
        let config = ProjectionShortcutConfig::new(2, 4);
        assert_eq!(config.in_channels(), 2);
        assert_eq!(config.out_channels(), 4);
        assert_eq!(config.stride(), 2);
        assert_eq!(config.output_resolution([8, 7]), [4, 4]);

        let config = config.with_stride(1);
        assert_eq!(config.output_resolution([8, 7]), [8, 7]);
    }

    #[test]
    fn test_shortcut_odd_resolution() {
        type B = NdArray<f32>;
        let device = Default::default();

        let shortcut: ProjectionShortcut<B> = ProjectionShortcutConfig::new(3, 8).init(&device);
        assert_eq!(shortcut.in_channels(), 3);
        assert_eq!(shortcut.out_channels(), 8);
        assert_eq!(shortcut.stride(), 2);

        let out = shortcut.forward(Tensor::ones([2, 3, 55, 55], &device));
        assert_shape_contract!(
            ["batch", "out_channels", "out_height", "out_width"],
            &out,
            &[
                ("batch", 2),
                ("out_channels", 8),
                ("out_height", 28),
                ("out_width", 28)
            ]
        );
    }
}
