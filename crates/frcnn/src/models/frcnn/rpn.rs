//! # Region Proposal Head
//!
//! Slides a small network over the backbone feature map and predicts, for
//! every position and each of `num_anchors` anchors, an objectness score and
//! four box deltas. Resolution is preserved.
//!
//! ```text
//! rpn_conv1:       3x3 conv -> 512, relu          N(0, 0.05)
//! rpn_out_class:   1x1 conv -> A, sigmoid         U(-0.05, 0.05)
//! rpn_out_regress: 1x1 conv -> 4A, linear         zeros
//! ```

use crate::compat::activation_wrapper::{Activation, ActivationConfig};
use crate::errors::{self, FrcnnError};
use crate::models::resnet::naming::{LayerSummary, apply_trainable};
use crate::models::resnet::util::{
    HEAD_NORMAL_INITIALIZER, HEAD_UNIFORM_INITIALIZER, same_padding,
};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Initializer, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::sigmoid;

/// Hidden convolution name.
pub const RPN_CONV_NAME: &str = "rpn_conv1";

/// Objectness head name.
pub const RPN_CLASS_NAME: &str = "rpn_out_class";

/// Box delta head name.
pub const RPN_REGRESS_NAME: &str = "rpn_out_regress";

/// [`RegionProposalHead`] Config.
#[derive(Config, Debug)]
pub struct RpnConfig {
    /// Anchors per feature-map position.
    pub num_anchors: usize,

    /// Feature-map channels.
    #[config(default = 1024)]
    pub in_channels: usize,

    /// Hidden convolution channels.
    #[config(default = 512)]
    pub hidden_channels: usize,

    /// Hidden convolution kernel size.
    #[config(default = 3)]
    pub kernel_size: usize,

    /// Hidden activation.
    #[config(default = "ActivationConfig::Relu")]
    pub activation: ActivationConfig,

    /// Whether the external optimizer may update the head.
    #[config(default = true)]
    pub trainable: bool,
}

impl RpnConfig {
    /// Check if the config is valid.
    pub fn try_validate(&self) -> errors::Result<()> {
        if self.num_anchors == 0 || self.in_channels == 0 || self.hidden_channels == 0 {
            return Err(FrcnnError::InvalidConfig {
                layer: RPN_CONV_NAME.to_string(),
                message: format!(
                    "num_anchors ({}), in_channels ({}) and hidden_channels ({}) must be positive",
                    self.num_anchors, self.in_channels, self.hidden_channels
                ),
            });
        }
        if same_padding(self.kernel_size).is_none() {
            return Err(FrcnnError::UnsupportedKernel {
                layer: RPN_CONV_NAME.to_string(),
                kernel_size: self.kernel_size,
            });
        }
        Ok(())
    }

    /// Initialize a [`RegionProposalHead`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> errors::Result<RegionProposalHead<B>> {
        self.try_validate()?;
        let k = self.kernel_size;
        let padding = k / 2;

        let conv = Conv2dConfig::new([self.in_channels, self.hidden_channels], [k, k])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_initializer(HEAD_NORMAL_INITIALIZER)
            .init(device);
        let class_head = Conv2dConfig::new([self.hidden_channels, self.num_anchors], [1, 1])
            .with_initializer(HEAD_UNIFORM_INITIALIZER)
            .init(device);
        let regress_head = Conv2dConfig::new([self.hidden_channels, 4 * self.num_anchors], [1, 1])
            .with_initializer(Initializer::Zeros)
            .init(device);

        let head = RegionProposalHead {
            num_anchors: self.num_anchors,
            trainable: self.trainable,
            conv,
            act: self.activation.init(),
            class_head,
            regress_head,
        };
        tracing::debug!(
            num_anchors = self.num_anchors,
            in_channels = self.in_channels,
            hidden_channels = self.hidden_channels,
            "initialized region proposal head"
        );
        Ok(apply_trainable(head, self.trainable))
    }

    /// Initialize a [`RegionProposalHead`].
    ///
    /// # Panics
    ///
    /// If the config is invalid.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> RegionProposalHead<B> {
        match self.try_init(device) {
            Ok(head) => head,
            Err(err) => panic!("{err}"),
        }
    }
}

/// [`RegionProposalHead`] output.
#[derive(Debug, Clone)]
pub struct RpnOutput<B: Backend> {
    /// Objectness in ``[0, 1]``: ``[batch, num_anchors, height, width]``.
    pub objectness: Tensor<B, 4>,

    /// Box deltas: ``[batch, 4 * num_anchors, height, width]``.
    pub deltas: Tensor<B, 4>,

    /// The hidden features: ``[batch, hidden_channels, height, width]``.
    pub features: Tensor<B, 4>,
}

/// Region Proposal Network head.
#[derive(Module, Debug)]
pub struct RegionProposalHead<B: Backend> {
    /// Anchors per position.
    pub num_anchors: usize,

    /// Trainability flag.
    pub trainable: bool,

    /// ``rpn_conv1``.
    pub conv: Conv2d<B>,

    /// Hidden activation.
    pub act: Activation,

    /// ``rpn_out_class``.
    pub class_head: Conv2d<B>,

    /// ``rpn_out_regress``.
    pub regress_head: Conv2d<B>,
}

impl<B: Backend> RegionProposalHead<B> {
    /// Feature-map channels.
    pub fn in_channels(&self) -> usize {
        self.conv.weight.dims()[1]
    }

    /// Hidden channels.
    pub fn hidden_channels(&self) -> usize {
        self.conv.weight.dims()[0]
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, height, width]``.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> RpnOutput<B> {
        let [batch, height, width] = unpack_shape_contract!(
            ["batch", "in_channels", "height", "width"],
            &input,
            &["batch", "height", "width"],
            &[("in_channels", self.in_channels())]
        );

        let features = self.act.forward(self.conv.forward(input));
        let objectness = sigmoid(self.class_head.forward(features.clone()));
        let deltas = self.regress_head.forward(features.clone());

        assert_shape_contract_periodically!(
            ["batch", "deltas" = "coords" * "anchors", "height", "width"],
            &deltas,
            &[
                ("batch", batch),
                ("coords", 4),
                ("anchors", self.num_anchors),
                ("height", height),
                ("width", width)
            ]
        );

        RpnOutput {
            objectness,
            deltas,
            features,
        }
    }

    /// The named layers of the head.
    pub fn layer_summaries(&self) -> Vec<LayerSummary> {
        vec![
            LayerSummary::of::<B, _>(RPN_CONV_NAME, &self.conv, self.trainable),
            LayerSummary::of::<B, _>(RPN_CLASS_NAME, &self.class_head, self.trainable),
            LayerSummary::of::<B, _>(RPN_REGRESS_NAME, &self.regress_head, self.trainable),
        ]
    }
}
