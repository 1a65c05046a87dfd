//! # `ResNet` C4 Backbone
//!
//! The shared feature extractor of the detector: the stem followed by
//! stages 2, 3 and 4 of `ResNet-50`. Stage 5 is held back for the
//! region-batched classifier head, so its cost is paid per region rather
//! than per image.
//!
//! | stage | filters | identity units | projection stride |
//! |---|---|---|---|
//! | 2 | 64, 64, 256 | 2 | 1 |
//! | 3 | 128, 128, 512 | 3 | 2 |
//! | 4 | 256, 256, 1024 | 5 | 2 |
//!
//! A ``224 x 224`` image yields a ``14 x 14 x 1024`` feature map.

use crate::errors::{self, FrcnnError};
use crate::models::resnet::naming::LayerSummary;
use crate::models::resnet::stage::{ResNetStage, StageConfig, StageMeta};
use crate::models::resnet::stem::{ResNetStem, ResNetStemConfig};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::prelude::{Backend, Tensor};

/// [`Backbone`] Config.
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// The input stem.
    #[config(default = "ResNetStemConfig::new()")]
    pub stem: ResNetStemConfig,

    /// The residual stages, in order.
    pub stages: Vec<StageConfig>,
}

impl BackboneConfig {
    /// The `ResNet-50` backbone truncated after stage 4.
    ///
    /// Frozen by default: the external optimizer leaves it untouched
    /// unless `trainable` is set.
    pub fn resnet50_c4() -> Self {
        Self::new(vec![
            StageConfig::new(2, 64, [64, 64, 256], 2).with_stride(1),
            StageConfig::new(3, 256, [128, 128, 512], 3),
            StageConfig::new(4, 512, [256, 256, 1024], 5),
        ])
        .with_trainable(false)
    }

    /// Set trainability on the stem and every stage.
    pub fn with_trainable(
        self,
        trainable: bool,
    ) -> Self {
        Self {
            stem: self.stem.with_trainable(trainable),
            stages: self
                .stages
                .into_iter()
                .map(|stage| stage.with_trainable(trainable))
                .collect(),
        }
    }

    /// The number of output feature-map channels.
    pub fn out_channels(&self) -> usize {
        match self.stages.last() {
            Some(stage) => stage.out_channels(),
            None => self.stem.out_channels,
        }
    }

    /// Predict the feature-map resolution for an image resolution.
    ///
    /// # Returns
    ///
    /// ``[out_height, out_width]``; or `None` if the image is too small
    /// for the stem, or the config is invalid.
    pub fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> Option<[usize; 2]> {
        self.try_validate().ok()?;
        let stem = self.stem.output_resolution(input_resolution)?;
        Some(
            self.stages
                .iter()
                .fold(stem, |res, stage| stage.output_resolution(res)),
        )
    }

    /// Check if the config is valid.
    ///
    /// The stem and every stage must be valid, and each stage must
    /// consume the channels its predecessor emits.
    pub fn try_validate(&self) -> errors::Result<()> {
        self.stem.try_validate()?;
        if self.stages.is_empty() {
            return Err(FrcnnError::InvalidConfig {
                layer: "backbone".to_string(),
                message: "no stages".to_string(),
            });
        }
        let mut producer = ("stem".to_string(), self.stem.out_channels);
        for stage in &self.stages {
            stage.try_validate()?;
            if producer.1 != stage.in_channels() {
                return Err(FrcnnError::ChannelMismatch {
                    producer: producer.0,
                    produced: producer.1,
                    consumer: format!("stage {}", stage.stage()),
                    expected: stage.in_channels(),
                });
            }
            producer = (format!("stage {}", stage.stage()), stage.out_channels());
        }
        Ok(())
    }

    /// Initialize a [`Backbone`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> errors::Result<Backbone<B>> {
        self.try_validate()?;

        let stem = self.stem.try_init(device)?;
        let stages = self
            .stages
            .iter()
            .map(|stage| stage.try_init(device))
            .collect::<errors::Result<Vec<_>>>()?;

        let backbone = Backbone { stem, stages };
        tracing::debug!(
            stages = backbone.stages.len(),
            out_channels = self.out_channels(),
            num_params = backbone.num_params(),
            "initialized backbone"
        );
        Ok(backbone)
    }
}

/// The backbone network.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    /// The input stem.
    pub stem: ResNetStem<B>,

    /// The residual stages.
    pub stages: Vec<ResNetStage<B>>,
}

impl<B: Backend> Backbone<B> {
    /// The number of output feature-map channels.
    pub fn out_channels(&self) -> usize {
        match self.stages.last() {
            Some(stage) => stage.out_channels(),
            None => self.stem.out_channels(),
        }
    }

    /// The accumulated stride of the residual stages.
    pub fn stage_stride(&self) -> usize {
        self.stages.iter().map(|stage| stage.stride()).product()
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: an image batch ``[batch, in_channels, height, width]``.
    ///
    /// # Returns
    ///
    /// The feature map ``[batch, out_channels, height / 16, width / 16]``
    /// (exact sizes per [`BackboneConfig::output_resolution`]).
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let x = self.stem.forward(input);
        let [batch] = unpack_shape_contract!(
            ["batch", "channels", "height", "width"],
            &x,
            &["batch"],
            &[("channels", self.stem.out_channels())]
        );

        let x = self.stages.iter().fold(x, |x, stage| stage.forward(x));

        assert_shape_contract_periodically!(
            ["batch", "out_channels", "height", "width"],
            &x,
            &[("batch", batch), ("out_channels", self.out_channels())]
        );
        x
    }

    /// The named layers of the backbone, in forward order.
    pub fn layer_summaries(&self) -> Vec<LayerSummary> {
        let mut summaries = self.stem.layer_summaries();
        for stage in &self.stages {
            summaries.extend(stage.layer_summaries());
        }
        summaries
    }
}
