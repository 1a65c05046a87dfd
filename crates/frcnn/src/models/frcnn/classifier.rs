//! # Classifier Head
//!
//! Scores and refines every pooled region:
//!
//! ```text
//! [batch, rois, 1024, 14, 14]
//!   -> region-batched stage 5 (512, 512, 2048)   [batch, rois, 2048, 7, 7]
//!   -> average pool, flatten                     [batch, rois, 2048]
//!   -> dense_class_{K}, softmax                  [batch, rois, K]
//!   -> dense_regress_{K}                         [batch, rois, 4 * (K - 1)]
//! ```
//!
//! Regions are independent; output row ``i`` belongs to proposal ``i``.

use crate::errors::{self, FrcnnError};
use crate::layers::pool::roi_pool::{
    DEFAULT_POOL_SIZE, RegionProposal, RoiPool2d, RoiPool2dConfig, RoiPoolingMode,
};
use crate::models::resnet::naming::{LayerSummary, apply_trainable};
use crate::models::resnet::region_batched::{RegionBatched, fold_regions};
use crate::models::resnet::stage::{ResNetStage, StageConfig, StageMeta};
use crate::models::resnet::util::HEAD_NORMAL_INITIALIZER;
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::softmax;
use serde::{Deserialize, Serialize};

/// Stage 5 of `ResNet-50`, run per region.
///
/// Convolutions use the head initializer, ``N(0, 0.05)``.
pub fn resnet50_stage5() -> StageConfig {
    StageConfig::new(5, 1024, [512, 512, 2048], 2).with_initializer(HEAD_NORMAL_INITIALIZER)
}

/// Box regression output convention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxRegression {
    /// Four deltas for each non-background class: ``4 * (K - 1)``.
    #[default]
    PerClass,

    /// Four deltas shared by all classes.
    ClassAgnostic,
}

impl BoxRegression {
    /// Minimum class count for this convention.
    pub fn min_classes(&self) -> usize {
        match self {
            Self::PerClass => 2,
            Self::ClassAgnostic => 1,
        }
    }

    /// Regression outputs for `num_classes` classes, background included.
    pub fn num_outputs(
        &self,
        num_classes: usize,
    ) -> usize {
        match self {
            Self::PerClass => 4 * num_classes.saturating_sub(1),
            Self::ClassAgnostic => 4,
        }
    }
}

/// Name of the class score layer.
pub fn dense_class_name(num_classes: usize) -> String {
    format!("dense_class_{num_classes}")
}

/// Name of the box regression layer.
pub fn dense_regress_name(num_classes: usize) -> String {
    format!("dense_regress_{num_classes}")
}

/// [`ClassifierHead`] Config.
#[derive(Config, Debug)]
pub struct ClassifierHeadConfig {
    /// Proposals per image.
    pub num_rois: usize,

    /// Classes, background included.
    pub num_classes: usize,

    /// Feature-map channels.
    #[config(default = 1024)]
    pub in_channels: usize,

    /// RoI pool grid size.
    #[config(default = "DEFAULT_POOL_SIZE")]
    pub pool_size: usize,

    /// RoI pool bin reduction.
    #[config(default = "RoiPoolingMode::Max")]
    pub pool_mode: RoiPoolingMode,

    /// The region-batched residual stage.
    #[config(default = "resnet50_stage5()")]
    pub stage: StageConfig,

    /// Box regression convention.
    #[config(default = "BoxRegression::PerClass")]
    pub regression: BoxRegression,

    /// Initializer of both dense layers.
    #[config(default = "Initializer::Zeros")]
    pub dense_initializer: Initializer,

    /// Whether the external optimizer may update the dense layers.
    #[config(default = true)]
    pub trainable: bool,
}

impl ClassifierHeadConfig {
    /// The [`RoiPool2d`] config.
    pub fn roi_pool_config(&self) -> RoiPool2dConfig {
        RoiPool2dConfig::new(self.num_rois)
            .with_pool_size(self.pool_size)
            .with_mode(self.pool_mode)
    }

    /// The stage output resolution; the average pool window.
    pub fn stage_output_resolution(&self) -> [usize; 2] {
        self.stage.output_resolution([self.pool_size, self.pool_size])
    }

    /// Check if the config is valid.
    pub fn try_validate(&self) -> errors::Result<()> {
        self.roi_pool_config().try_validate()?;
        self.stage.try_validate()?;
        if self.in_channels != self.stage.in_channels() {
            return Err(FrcnnError::ChannelMismatch {
                producer: "roi_pool".to_string(),
                produced: self.in_channels,
                consumer: format!("stage {}", self.stage.stage()),
                expected: self.stage.in_channels(),
            });
        }
        if self.num_classes < self.regression.min_classes() {
            return Err(FrcnnError::InvalidConfig {
                layer: dense_regress_name(self.num_classes),
                message: format!(
                    "{:?} regression needs at least {} classes, got {}",
                    self.regression,
                    self.regression.min_classes(),
                    self.num_classes
                ),
            });
        }
        Ok(())
    }

    /// Initialize a [`ClassifierHead`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> errors::Result<ClassifierHead<B>> {
        self.try_validate()?;

        let roi_pool = self.roi_pool_config().try_init()?;
        let stage = self.stage.try_init(device)?;
        let features = self.stage.out_channels();
        let [pool_height, pool_width] = self.stage_output_resolution();
        let avg_pool = AvgPool2dConfig::new([pool_height, pool_width])
            .with_strides([pool_height, pool_width])
            .init();

        let dense_class = LinearConfig::new(features, self.num_classes)
            .with_initializer(self.dense_initializer.clone())
            .init(device);
        let dense_regress =
            LinearConfig::new(features, self.regression.num_outputs(self.num_classes))
                .with_initializer(self.dense_initializer.clone())
                .init(device);

        tracing::debug!(
            num_rois = self.num_rois,
            num_classes = self.num_classes,
            regression = ?self.regression,
            "initialized classifier head"
        );

        Ok(ClassifierHead {
            num_classes: self.num_classes,
            trainable: self.trainable,
            roi_pool,
            stage,
            avg_pool,
            dense_class: apply_trainable(dense_class, self.trainable),
            dense_regress: apply_trainable(dense_regress, self.trainable),
        })
    }

    /// Initialize a [`ClassifierHead`].
    ///
    /// # Panics
    ///
    /// If the config is invalid.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ClassifierHead<B> {
        match self.try_init(device) {
            Ok(head) => head,
            Err(err) => panic!("{err}"),
        }
    }
}

/// [`ClassifierHead`] output.
#[derive(Debug, Clone)]
pub struct ClassifierOutput<B: Backend> {
    /// Class probabilities: ``[batch, num_rois, num_classes]``.
    pub class_scores: Tensor<B, 3>,

    /// Box refinements: ``[batch, num_rois, regression_outputs]``.
    pub box_deltas: Tensor<B, 3>,
}

/// RoI classifier head.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    /// Classes, background included.
    pub num_classes: usize,

    /// Dense layer trainability.
    pub trainable: bool,

    /// Region pooling.
    pub roi_pool: RoiPool2d,

    /// Region-batched stage.
    pub stage: ResNetStage<B>,

    /// Per-region average pool.
    pub avg_pool: AvgPool2d,

    /// ``dense_class_{K}``.
    pub dense_class: Linear<B>,

    /// ``dense_regress_{K}``.
    pub dense_regress: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    /// Proposals per image.
    pub fn num_rois(&self) -> usize {
        self.roi_pool.num_rois
    }

    /// Feature-map channels.
    pub fn in_channels(&self) -> usize {
        self.stage.in_channels()
    }

    /// Box regression outputs per region.
    pub fn regression_outputs(&self) -> usize {
        self.dense_regress.weight.dims()[1]
    }

    /// Pool proposals from a feature map and classify them.
    ///
    /// # Arguments
    ///
    /// - `features`: ``[batch, in_channels, height, width]``.
    /// - `proposals`: ``[batch, num_rois, 4]``.
    pub fn forward(
        &self,
        features: Tensor<B, 4>,
        proposals: Tensor<B, 3>,
    ) -> errors::Result<ClassifierOutput<B>> {
        let pooled = self.roi_pool.forward(features, proposals)?;
        Ok(self.forward_pooled(pooled))
    }

    /// [`ClassifierHead::forward`], with proposals given per image.
    pub fn forward_proposals(
        &self,
        features: Tensor<B, 4>,
        proposals: &[Vec<RegionProposal>],
    ) -> errors::Result<ClassifierOutput<B>> {
        let pooled = self.roi_pool.pool(features, proposals)?;
        Ok(self.forward_pooled(pooled))
    }

    /// Classify already pooled regions.
    ///
    /// # Arguments
    ///
    /// - `pooled`: ``[batch, num_rois, in_channels, pool_size, pool_size]``.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn forward_pooled(
        &self,
        pooled: Tensor<B, 5>,
    ) -> ClassifierOutput<B> {
        let [batch] = unpack_shape_contract!(
            ["batch", "rois", "channels", "height", "width"],
            &pooled,
            &["batch"],
            &[
                ("rois", self.num_rois()),
                ("channels", self.in_channels()),
                ("height", self.roi_pool.pool_size),
                ("width", self.roi_pool.pool_size)
            ]
        );

        let x = self.stage.forward_regions(pooled);
        let (x, [_, rois]) = fold_regions(x);
        let x = self.avg_pool.forward(x);
        let x = x.reshape([batch, rois, self.stage.out_channels()]);

        let class_scores = softmax(self.dense_class.forward(x.clone()), 2);
        let box_deltas = self.dense_regress.forward(x);

        assert_shape_contract_periodically!(
            ["batch", "rois", "classes"],
            &class_scores,
            &[
                ("batch", batch),
                ("rois", rois),
                ("classes", self.num_classes)
            ]
        );

        ClassifierOutput {
            class_scores,
            box_deltas,
        }
    }

    /// The named layers of the head, in forward order.
    pub fn layer_summaries(&self) -> Vec<LayerSummary> {
        let mut summaries = self.stage.layer_summaries();
        summaries.push(LayerSummary::of::<B, _>(
            dense_class_name(self.num_classes),
            &self.dense_class,
            self.trainable,
        ));
        summaries.push(LayerSummary::of::<B, _>(
            dense_regress_name(self.num_classes),
            &self.dense_regress,
            self.trainable,
        ));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_close, to_vec};
    use bimm_contracts::assert_shape_contract;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray<f32>;

    fn tiny_config(num_classes: usize) -> ClassifierHeadConfig {
        ClassifierHeadConfig::new(3, num_classes)
            .with_in_channels(8)
            .with_pool_size(4)
            .with_stage(
                StageConfig::new(5, 8, [4, 4, 16], 1).with_initializer(HEAD_NORMAL_INITIALIZER),
            )
    }

    #[test]
    fn test_default_config() {
        let config = ClassifierHeadConfig::new(32, 21);
        config.try_validate().unwrap();
        assert_eq!(config.pool_size, 14);
        assert_eq!(config.stage.filters, [512, 512, 2048]);
        assert_eq!(config.stage.identity_units, 2);
        assert_eq!(config.stage_output_resolution(), [7, 7]);
        assert_eq!(config.regression.num_outputs(21), 80);
        assert_eq!(BoxRegression::ClassAgnostic.num_outputs(21), 4);
    }

    #[test]
    fn test_invalid_configs() {
        assert_eq!(
            ClassifierHeadConfig::new(0, 21).try_validate(),
            Err(FrcnnError::InvalidNumRois(0))
        );

        assert!(matches!(
            ClassifierHeadConfig::new(4, 21)
                .with_in_channels(512)
                .try_validate(),
            Err(FrcnnError::ChannelMismatch { .. })
        ));

        assert!(matches!(
            tiny_config(1).try_validate(),
            Err(FrcnnError::InvalidConfig { .. })
        ));
        tiny_config(1)
            .with_regression(BoxRegression::ClassAgnostic)
            .try_validate()
            .unwrap();
    }

    #[test]
    fn test_untrained_head_outputs() {
        let device = Default::default();
        let config = tiny_config(5);
        let head: ClassifierHead<B> = config.init(&device);
        assert_eq!(head.num_rois(), 3);
        assert_eq!(head.regression_outputs(), 16);

        let pooled: Tensor<B, 5> =
            Tensor::random([2, 3, 8, 4, 4], Distribution::Default, &device);
        let output = head.forward_pooled(pooled);

        assert_shape_contract!(
            ["batch", "rois", "classes"],
            &output.class_scores,
            &[("batch", 2), ("rois", 3), ("classes", 5)],
        );
        assert_shape_contract!(
            ["batch", "rois", "deltas"],
            &output.box_deltas,
            &[("batch", 2), ("rois", 3), ("deltas", 16)],
        );

        assert!(
            to_vec(output.class_scores)
                .iter()
                .all(|&p| (p - 0.2).abs() < 1e-6)
        );
        assert!(to_vec(output.box_deltas).iter().all(|&d| d == 0.0));
    }

    #[test]
    fn test_class_agnostic_regression() {
        let device = Default::default();
        let head: ClassifierHead<B> = tiny_config(5)
            .with_regression(BoxRegression::ClassAgnostic)
            .init(&device);
        assert_eq!(head.regression_outputs(), 4);
    }

    #[test]
    fn test_rows_follow_proposal_order() {
        let device = Default::default();
        let head: ClassifierHead<B> = tiny_config(4)
            .with_dense_initializer(HEAD_NORMAL_INITIALIZER)
            .init(&device);

        let features: Tensor<B, 4> =
            Tensor::random([1, 8, 10, 10], Distribution::Default, &device);
        let a = RegionProposal::new(0.0, 0.0, 4.0, 6.0);
        let b = RegionProposal::new(3.0, 2.0, 7.0, 7.0);
        let c = RegionProposal::new(5.0, 5.0, 2.0, 3.0);

        let forward = head
            .forward_proposals(features.clone(), &[vec![a, b, c]])
            .unwrap();
        let permuted = head
            .forward_proposals(features, &[vec![c, a, b]])
            .unwrap();

        let row = |t: &Tensor<B, 3>, i: usize| t.clone().slice([0..1, i..i + 1, 0..4]);
        for (src, dst) in [(0, 1), (1, 2), (2, 0)] {
            assert_close(
                row(&permuted.class_scores, dst),
                row(&forward.class_scores, src),
                1e-5,
            );
        }

        let sums = to_vec(forward.class_scores.sum_dim(2));
        assert!(sums.iter().all(|&s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_layer_summaries() {
        let device = Default::default();
        let head: ClassifierHead<B> = tiny_config(3).init(&device);
        let summaries = head.layer_summaries();
        let names: Vec<&str> = summaries.iter().map(|s| s.name.as_str()).collect();

        assert_eq!(names[0], "res5a_branch2a");
        assert_eq!(names[names.len() - 2], "dense_class_3");
        assert_eq!(names[names.len() - 1], "dense_regress_3");
        assert_eq!(summaries[names.len() - 2].num_params, 16 * 3 + 3);
        assert_eq!(summaries[names.len() - 1].num_params, 16 * 8 + 8);
    }
}
