//! # `ResNet` Stage
//!
//! A [`ResNetStage`] is one projection unit (block ``a``) followed by
//! identity units (blocks ``b``, ``c``, ...), all sharing one filter
//! configuration. The projection unit performs the stage's downsampling
//! and channel expansion.
//!
//! [`StageMeta`] defines a common meta API for [`ResNetStage`]
//! and [`StageConfig`].

use crate::compat::conv_shape::stride_ceil_output_resolution;
use crate::compat::normalization_wrapper::NormalizationConfig;
use crate::errors::{self, FrcnnError};
use crate::models::resnet::naming::{LayerSummary, LayerTag};
use crate::models::resnet::region_batched::RegionBatched;
use crate::models::resnet::unit::{ResidualUnit, ResidualUnitConfig, ResidualUnitMeta};
use crate::models::resnet::util::CONV_INTO_RELU_INITIALIZER;
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::nn::Initializer;
use burn::prelude::{Backend, Module, Tensor};

/// [`ResNetStage`] Meta API.
pub trait StageMeta {
    /// The stage number.
    fn stage(&self) -> usize;

    /// The number of input channels.
    fn in_channels(&self) -> usize;

    /// The ``(c1, c2, c3)`` filter configuration.
    fn filters(&self) -> [usize; 3];

    /// The number of identity units after the projection unit.
    fn identity_units(&self) -> usize;

    /// The stride of the projection unit.
    fn stride(&self) -> usize;

    /// The number of output channels; ``c3``.
    fn out_channels(&self) -> usize {
        self.filters()[2]
    }

    /// Get the output resolution for a given input resolution.
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        stride_ceil_output_resolution(input_resolution, self.stride())
    }
}

/// [`ResNetStage`] Configuration.
#[derive(Config, Debug)]
pub struct StageConfig {
    /// The stage number, used for layer tags.
    pub stage: usize,

    /// The number of input channels.
    pub in_channels: usize,

    /// The ``(c1, c2, c3)`` filter configuration.
    pub filters: [usize; 3],

    /// The number of identity units after the projection unit.
    pub identity_units: usize,

    /// The stride of the projection unit.
    #[config(default = 2)]
    pub stride: usize,

    /// The middle kernel size of every unit.
    #[config(default = 3)]
    pub kernel_size: usize,

    /// Whether the external optimizer may update the stage.
    #[config(default = true)]
    pub trainable: bool,

    /// Normalization for every unit.
    #[config(default = "NormalizationConfig::default()")]
    pub normalization: NormalizationConfig,

    /// Convolution initializer for every unit.
    #[config(default = "CONV_INTO_RELU_INITIALIZER")]
    pub initializer: Initializer,
}

impl StageMeta for StageConfig {
    fn stage(&self) -> usize {
        self.stage
    }

    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn filters(&self) -> [usize; 3] {
        self.filters
    }

    fn identity_units(&self) -> usize {
        self.identity_units
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

impl StageConfig {
    /// The unit configs, block ``a`` first.
    pub fn unit_configs(&self) -> Vec<ResidualUnitConfig> {
        let out_channels = self.out_channels();
        (0..=self.identity_units)
            .map(|idx| {
                let tag = LayerTag::for_index(self.stage, idx);
                let unit = if idx == 0 {
                    ResidualUnitConfig::projection(tag, self.in_channels, self.filters)
                        .with_stride(self.stride)
                } else {
                    ResidualUnitConfig::identity(tag, out_channels, self.filters)
                };
                unit.with_kernel_size(self.kernel_size)
                    .with_trainable(self.trainable)
                    .with_normalization(self.normalization.clone())
                    .with_initializer(self.initializer.clone())
            })
            .collect()
    }

    /// Check if the config is valid.
    ///
    /// Validates each unit. Units chain by construction: identity units
    /// take the ``c3`` channels the projection unit emits.
    pub fn try_validate(&self) -> errors::Result<()> {
        if self.identity_units >= 26 {
            return Err(FrcnnError::InvalidConfig {
                layer: format!("stage {}", self.stage),
                message: format!("{} identity units exceed the block letters", self.identity_units),
            });
        }
        for unit in self.unit_configs() {
            unit.try_validate()?;
        }
        Ok(())
    }

    /// Initialize a new [`ResNetStage`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> errors::Result<ResNetStage<B>> {
        self.try_validate()?;
        let units = self
            .unit_configs()
            .iter()
            .map(|unit| unit.try_init(device))
            .collect::<errors::Result<Vec<_>>>()?;

        tracing::debug!(
            stage = self.stage,
            units = units.len(),
            filters = ?self.filters,
            stride = self.stride,
            trainable = self.trainable,
            "initialized resnet stage"
        );

        Ok(ResNetStage { units })
    }
}

/// A sequence of [`ResidualUnit`]s; projection first.
#[derive(Module, Debug)]
pub struct ResNetStage<B: Backend> {
    /// Internal units.
    pub units: Vec<ResidualUnit<B>>,
}

impl<B: Backend> StageMeta for ResNetStage<B> {
    fn stage(&self) -> usize {
        self.units[0].tag().stage
    }

    fn in_channels(&self) -> usize {
        self.units[0].in_channels()
    }

    fn filters(&self) -> [usize; 3] {
        self.units[0].filters()
    }

    fn identity_units(&self) -> usize {
        self.units.len() - 1
    }

    fn stride(&self) -> usize {
        self.units.iter().map(|unit| unit.stride()).product()
    }
}

impl<B: Backend> ResNetStage<B> {
    /// Apply the stage.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// ``[batch, c3, ceil(in_height / stride), ceil(in_width / stride)]``
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

        let x = self.units.iter().fold(input, |x, unit| unit.forward(x));

        assert_shape_contract_periodically!(
            ["batch", "out_channels", "out_height", "out_width"],
            &x,
            &[
                ("batch", batch),
                ("out_channels", self.out_channels()),
                ("out_height", out_height),
                ("out_width", out_width)
            ]
        );

        x
    }

    /// The named layers of the stage, in forward order.
    pub fn layer_summaries(&self) -> Vec<LayerSummary> {
        self.units
            .iter()
            .flat_map(|unit| unit.layer_summaries())
            .collect()
    }
}

impl<B: Backend> RegionBatched<B> for ResNetStage<B> {
    fn forward_image(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        self.forward(input)
    }
}
