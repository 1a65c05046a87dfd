//! # Residual Units
//!
//! A [`ResidualUnit`] is the bottleneck building block of the `ResNet` stages,
//! in one of two [`ResidualUnitKind`]s:
//!
//! * [`ResidualUnitKind::Identity`] - shape preserving; the unit input is
//!   added, untransformed, to the main path output.
//! * [`ResidualUnitKind::Projection`] - shape changing; the first main path
//!   convolution and a learned [`ProjectionShortcut`] both apply the stride.
//!
//! Both kinds share the main path:
//!
//! ```text
//! 1x1 conv -> c1, norm, relu     (stride on projection units)
//! kxk conv -> c2, norm, relu     (same-size padding)
//! 1x1 conv -> c3, norm
//! + shortcut
//! relu
//! ```
//!
//! [`ResidualUnitMeta`] defines a common meta API for [`ResidualUnit`]
//! and [`ResidualUnitConfig`].
//!
//! [`ResidualUnitConfig`] implements [`Config`], and provides
//! [`ResidualUnitConfig::try_init`] to initialize a [`ResidualUnit`].

use crate::compat::conv_shape::stride_ceil_output_resolution;
use crate::compat::normalization_wrapper::NormalizationConfig;
use crate::errors::{self, FrcnnError};
use crate::layers::blocks::cna::{AbstractCNA2dConfig, CNA2d, CNA2dConfig, CNA2dMeta};
use crate::models::resnet::naming::{
    LayerSummary, LayerTag, MAIN_BRANCHES, SHORTCUT_BRANCH, apply_trainable,
};
use crate::models::resnet::region_batched::RegionBatched;
use crate::models::resnet::shortcut::{
    ProjectionShortcut, ProjectionShortcutConfig, ProjectionShortcutMeta,
};
use crate::models::resnet::util::{CONV_INTO_RELU_INITIALIZER, same_padding};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::module::Ignored;
use burn::nn::conv::Conv2dConfig;
use burn::nn::{Initializer, PaddingConfig2d};
use burn::prelude::{Backend, Config, Module, Tensor};
use serde::{Deserialize, Serialize};

/// The two residual unit variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResidualUnitKind {
    /// Shape preserving; untransformed shortcut.
    Identity,

    /// Shape changing; learned, strided 1x1 shortcut.
    Projection,
}

/// [`ResidualUnit`] Meta trait.
pub trait ResidualUnitMeta {
    /// The unit kind.
    fn kind(&self) -> ResidualUnitKind;

    /// The stage/block tag.
    fn tag(&self) -> LayerTag;

    /// The number of input channels.
    fn in_channels(&self) -> usize;

    /// The ``(c1, c2, c3)`` filter configuration.
    fn filters(&self) -> [usize; 3];

    /// The size of the middle convolution's square kernel.
    fn kernel_size(&self) -> usize;

    /// The stride applied by the unit.
    fn stride(&self) -> usize;

    /// The number of output channels; ``c3``.
    fn out_channels(&self) -> usize {
        self.filters()[2]
    }

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

/// [`ResidualUnit`] Config.
///
/// Implements [`ResidualUnitMeta`].
#[derive(Config, Debug)]
pub struct ResidualUnitConfig {
    /// The unit kind.
    pub kind: ResidualUnitKind,

    /// The stage/block tag.
    pub tag: LayerTag,

    /// The number of input channels.
    pub in_channels: usize,

    /// The ``(c1, c2, c3)`` filter configuration.
    pub filters: [usize; 3],

    /// The size of the middle convolution's square kernel; must be odd.
    #[config(default = 3)]
    pub kernel_size: usize,

    /// The stride; must be 1 for identity units.
    #[config(default = 1)]
    pub stride: usize,

    /// Whether the external optimizer may update the unit.
    #[config(default = true)]
    pub trainable: bool,

    /// [`crate::compat::normalization_wrapper::Normalization`] config.
    ///
    /// The feature size is matched to each convolution.
    #[config(default = "NormalizationConfig::default()")]
    pub normalization: NormalizationConfig,

    /// Convolution initializer.
    #[config(default = "CONV_INTO_RELU_INITIALIZER")]
    pub initializer: Initializer,
}

impl ResidualUnitMeta for ResidualUnitConfig {
    fn kind(&self) -> ResidualUnitKind {
        self.kind
    }

    fn tag(&self) -> LayerTag {
        self.tag
    }

    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn filters(&self) -> [usize; 3] {
        self.filters
    }

    fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

impl ResidualUnitConfig {
    /// An identity unit over `channels`; ``filters[2]`` must equal `channels`.
    pub fn identity(
        tag: LayerTag,
        channels: usize,
        filters: [usize; 3],
    ) -> Self {
        Self::new(ResidualUnitKind::Identity, tag, channels, filters)
    }

    /// A projection unit with the default stride of 2.
    pub fn projection(
        tag: LayerTag,
        in_channels: usize,
        filters: [usize; 3],
    ) -> Self {
        Self::new(ResidualUnitKind::Projection, tag, in_channels, filters).with_stride(2)
    }

    /// Check the structural preconditions of the unit.
    ///
    /// # Errors
    ///
    /// * [`FrcnnError::InvalidConfig`] for zero channels or stride,
    ///   an identity unit with a stride other than 1, or a normalization
    ///   that cannot be built over a branch's channels.
    /// * [`FrcnnError::UnsupportedKernel`] for even kernels.
    /// * [`FrcnnError::ShapeMismatch`] for an identity unit whose
    ///   ``c3`` differs from its input channels.
    pub fn try_validate(&self) -> errors::Result<()> {
        let layer = self.tag.conv_name(MAIN_BRANCHES[2]);
        if self.in_channels == 0 || self.filters.contains(&0) {
            return Err(FrcnnError::InvalidConfig {
                layer,
                message: format!(
                    "channel counts must be positive: in_channels={}, filters={:?}",
                    self.in_channels, self.filters
                ),
            });
        }
        if self.stride == 0 {
            return Err(FrcnnError::InvalidConfig {
                layer,
                message: "stride must be positive".to_string(),
            });
        }
        if same_padding(self.kernel_size).is_none() {
            return Err(FrcnnError::UnsupportedKernel {
                layer: self.tag.conv_name(MAIN_BRANCHES[1]),
                kernel_size: self.kernel_size,
            });
        }
        for (branch, channels) in MAIN_BRANCHES.iter().zip(self.filters) {
            if !self.normalization.supports_num_features(channels) {
                return Err(FrcnnError::InvalidConfig {
                    layer: self.tag.norm_name(branch),
                    message: format!(
                        "{:?} cannot normalize {channels} channels",
                        self.normalization
                    ),
                });
            }
        }
        if self.kind == ResidualUnitKind::Identity {
            if self.stride != 1 {
                return Err(FrcnnError::InvalidConfig {
                    layer,
                    message: format!("identity units require stride 1, got {}", self.stride),
                });
            }
            if self.filters[2] != self.in_channels {
                return Err(FrcnnError::ShapeMismatch {
                    layer,
                    message: format!(
                        "identity shortcut carries {} channels, main path emits {}",
                        self.in_channels, self.filters[2]
                    ),
                });
            }
        }
        Ok(())
    }

    /// Initialize a [`ResidualUnit`].
    ///
    /// # Errors
    ///
    /// See [`ResidualUnitConfig::try_validate`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> errors::Result<ResidualUnit<B>> {
        self.try_validate()?;

        let [c1, c2, c3] = self.filters;
        let stride = self.stride;
        let padding = self.kernel_size / 2;

        let cna_builder = AbstractCNA2dConfig::new(self.normalization.clone());
        let conv = |channels: [usize; 2], kernel_size: usize| {
            Conv2dConfig::new(channels, [kernel_size, kernel_size])
                .with_initializer(self.initializer.clone())
        };

        let cna1: CNA2dConfig = cna_builder.build_config(
            conv([self.in_channels, c1], 1)
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Valid),
        );
        let cna2: CNA2dConfig = cna_builder.build_config(
            conv([c1, c2], self.kernel_size)
                .with_padding(PaddingConfig2d::Explicit(padding, padding)),
        );
        let cna3: CNA2dConfig =
            cna_builder.build_config(conv([c2, c3], 1).with_padding(PaddingConfig2d::Valid));

        let shortcut = match self.kind {
            ResidualUnitKind::Identity => None,
            ResidualUnitKind::Projection => Some(
                ProjectionShortcutConfig::new(self.in_channels, c3)
                    .with_stride(stride)
                    .with_normalization(self.normalization.clone())
                    .with_initializer(self.initializer.clone())
                    .init(device),
            ),
        };

        let unit = ResidualUnit {
            tag: Ignored(self.tag),
            trainable: self.trainable,
            kernel_size: self.kernel_size,
            cna1: cna1.init(device),
            cna2: cna2.init(device),
            cna3: cna3.init(device),
            shortcut,
        };

        Ok(apply_trainable(unit, self.trainable))
    }

    /// Initialize a [`ResidualUnit`].
    ///
    /// # Panics
    ///
    /// If the config is invalid; see [`ResidualUnitConfig::try_validate`].
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResidualUnit<B> {
        match self.try_init(device) {
            Ok(unit) => unit,
            Err(err) => panic!("{err}"),
        }
    }
}

/// Bottleneck residual unit.
///
/// Implements [`ResidualUnitMeta`] and [`RegionBatched`].
#[derive(Module, Debug)]
pub struct ResidualUnit<B: Backend> {
    /// Stage/block tag.
    pub tag: Ignored<LayerTag>,

    /// Trainability metadata.
    pub trainable: bool,

    /// Middle kernel size.
    pub kernel_size: usize,

    /// ``1x1 -> c1`` conv/norm/relu; carries the stride.
    pub cna1: CNA2d<B>,

    /// ``kxk -> c2`` conv/norm/relu.
    pub cna2: CNA2d<B>,

    /// ``1x1 -> c3`` conv/norm, shortcut addition, relu.
    pub cna3: CNA2d<B>,

    /// The learned shortcut of projection units.
    pub shortcut: Option<ProjectionShortcut<B>>,
}

impl<B: Backend> ResidualUnitMeta for ResidualUnit<B> {
    fn kind(&self) -> ResidualUnitKind {
        match self.shortcut {
            Some(_) => ResidualUnitKind::Projection,
            None => ResidualUnitKind::Identity,
        }
    }

    fn tag(&self) -> LayerTag {
        self.tag.0
    }

    fn in_channels(&self) -> usize {
        self.cna1.in_channels()
    }

    fn filters(&self) -> [usize; 3] {
        [
            self.cna1.out_channels(),
            self.cna2.out_channels(),
            self.cna3.out_channels(),
        ]
    }

    fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    fn stride(&self) -> usize {
        self.cna1.stride()
    }
}

impl<B: Backend> ResidualUnit<B> {
    /// Forward Pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, c3, ceil(in_height / stride), ceil(in_width / stride)]`` tensor.
    ///
    /// # Panics
    ///
    /// If `input` does not carry `in_channels` channels.
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
        let out_bindings = [
            ("batch", batch),
            ("out_channels", self.out_channels()),
            ("out_height", out_height),
            ("out_width", out_width),
        ];

        let shortcut = match &self.shortcut {
            Some(shortcut) => shortcut.forward(input.clone()),
            None => input.clone(),
        };
        assert_shape_contract_periodically!(
            ["batch", "out_channels", "out_height", "out_width"],
            &shortcut,
            &out_bindings
        );

        let x = self.cna1.forward(input);
        let x = self.cna2.forward(x);
        self.cna3.hook_forward(x, |x| {
            assert_shape_contract_periodically!(
                ["batch", "out_channels", "out_height", "out_width"],
                &x,
                &out_bindings
            );
            x + shortcut
        })
    }

    /// The named layers of the unit, in forward order.
    pub fn layer_summaries(&self) -> Vec<LayerSummary> {
        let tag = self.tag.0;
        let mut summaries = Vec::new();
        for (branch, cna) in MAIN_BRANCHES.iter().zip([&self.cna1, &self.cna2, &self.cna3]) {
            summaries.push(LayerSummary::of::<B, _>(
                tag.conv_name(branch),
                &cna.conv,
                self.trainable,
            ));
            summaries.push(LayerSummary::of::<B, _>(
                tag.norm_name(branch),
                &cna.norm,
                self.trainable,
            ));
        }
        if let Some(shortcut) = &self.shortcut {
            summaries.push(LayerSummary::of::<B, _>(
                tag.conv_name(SHORTCUT_BRANCH),
                &shortcut.conv,
                self.trainable,
            ));
            summaries.push(LayerSummary::of::<B, _>(
                tag.norm_name(SHORTCUT_BRANCH),
                &shortcut.norm,
                self.trainable,
            ));
        }
        summaries
    }
}

impl<B: Backend> RegionBatched<B> for ResidualUnit<B> {
    fn forward_image(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        self.forward(input)
    }
}
