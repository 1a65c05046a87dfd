//! # Faster R-CNN Graph
//!
//! [`FasterRcnnConfig`] assembles the backbone, region proposal head and
//! classifier head, checking that they agree on channel counts before any
//! parameters are allocated.
//!
//! ```rust,no_run
//! use burn::backend::NdArray;
//! use burn::prelude::Tensor;
//! use frcnn::models::frcnn::detector::{FasterRcnn, FasterRcnnConfig};
//!
//! let device = Default::default();
//! let model: FasterRcnn<NdArray> = FasterRcnnConfig::new_resnet50(9, 32, 21)
//!     .try_init(&device)
//!     .unwrap();
//!
//! let image: Tensor<NdArray, 4> = Tensor::zeros([1, 3, 224, 224], &device);
//! let features = model.build_backbone(image);
//! let rpn = model.build_rpn(features);
//! assert_eq!(rpn.objectness.dims(), [1, 9, 14, 14]);
//! ```

use crate::errors::{self, FrcnnError};
use crate::layers::pool::roi_pool::RegionProposal;
use crate::models::frcnn::classifier::{ClassifierHead, ClassifierHeadConfig, ClassifierOutput};
use crate::models::frcnn::rpn::{RegionProposalHead, RpnConfig, RpnOutput};
use crate::models::resnet::backbone::{Backbone, BackboneConfig};
use crate::models::resnet::naming::LayerSummary;
use burn::config::Config;
use burn::module::Module;
use burn::prelude::{Backend, Tensor};

/// [`FasterRcnn`] Config.
#[derive(Config, Debug)]
pub struct FasterRcnnConfig {
    /// Shared feature extractor.
    pub backbone: BackboneConfig,

    /// Region proposal head.
    pub rpn: RpnConfig,

    /// Region classifier head.
    pub classifier: ClassifierHeadConfig,
}

impl FasterRcnnConfig {
    /// The `ResNet-50` C4 detector.
    ///
    /// # Arguments
    ///
    /// - `num_anchors`: anchors per feature-map position.
    /// - `num_rois`: proposals per image.
    /// - `num_classes`: classes, background included.
    pub fn new_resnet50(
        num_anchors: usize,
        num_rois: usize,
        num_classes: usize,
    ) -> Self {
        Self::new(
            BackboneConfig::resnet50_c4(),
            RpnConfig::new(num_anchors),
            ClassifierHeadConfig::new(num_rois, num_classes),
        )
    }

    /// Predict the feature-map resolution for an image resolution.
    pub fn feature_resolution(
        &self,
        image_resolution: [usize; 2],
    ) -> Option<[usize; 2]> {
        self.backbone.output_resolution(image_resolution)
    }

    /// Check if the config is valid.
    pub fn try_validate(&self) -> errors::Result<()> {
        self.backbone.try_validate()?;
        self.rpn.try_validate()?;
        self.classifier.try_validate()?;

        let produced = self.backbone.out_channels();
        for (consumer, expected) in [
            ("rpn", self.rpn.in_channels),
            ("classifier", self.classifier.in_channels),
        ] {
            if produced != expected {
                return Err(FrcnnError::ChannelMismatch {
                    producer: "backbone".to_string(),
                    produced,
                    consumer: consumer.to_string(),
                    expected,
                });
            }
        }
        Ok(())
    }

    /// Initialize a [`FasterRcnn`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> errors::Result<FasterRcnn<B>> {
        self.try_validate()?;
        let model = FasterRcnn {
            backbone: self.backbone.try_init(device)?,
            rpn: self.rpn.try_init(device)?,
            classifier: self.classifier.try_init(device)?,
        };
        tracing::debug!(num_params = model.num_params(), "initialized faster r-cnn");
        Ok(model)
    }

    /// Initialize a [`FasterRcnn`].
    ///
    /// # Panics
    ///
    /// If the config is invalid.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> FasterRcnn<B> {
        match self.try_init(device) {
            Ok(model) => model,
            Err(err) => panic!("{err}"),
        }
    }
}

/// The Faster R-CNN detector graph.
#[derive(Module, Debug)]
pub struct FasterRcnn<B: Backend> {
    /// Shared feature extractor.
    pub backbone: Backbone<B>,

    /// Region proposal head.
    pub rpn: RegionProposalHead<B>,

    /// Region classifier head.
    pub classifier: ClassifierHead<B>,
}

impl<B: Backend> FasterRcnn<B> {
    /// Anchors per feature-map position.
    pub fn num_anchors(&self) -> usize {
        self.rpn.num_anchors
    }

    /// Proposals per image.
    pub fn num_rois(&self) -> usize {
        self.classifier.num_rois()
    }

    /// Classes, background included.
    pub fn num_classes(&self) -> usize {
        self.classifier.num_classes
    }

    /// Image to feature map.
    ///
    /// ``[batch, 3, height, width] -> [batch, 1024, height', width']``
    pub fn build_backbone(
        &self,
        image: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        self.backbone.forward(image)
    }

    /// Feature map to objectness and box deltas.
    pub fn build_rpn(
        &self,
        feature_map: Tensor<B, 4>,
    ) -> RpnOutput<B> {
        self.rpn.forward(feature_map)
    }

    /// Feature map and ``[batch, num_rois, 4]`` proposals to per-region
    /// class scores and box refinements.
    pub fn build_classifier(
        &self,
        feature_map: Tensor<B, 4>,
        proposals: Tensor<B, 3>,
    ) -> errors::Result<ClassifierOutput<B>> {
        self.classifier.forward(feature_map, proposals)
    }

    /// [`FasterRcnn::build_classifier`], with proposals given per image.
    pub fn classify_proposals(
        &self,
        feature_map: Tensor<B, 4>,
        proposals: &[Vec<RegionProposal>],
    ) -> errors::Result<ClassifierOutput<B>> {
        self.classifier.forward_proposals(feature_map, proposals)
    }

    /// Every named layer, in graph order.
    pub fn layer_summaries(&self) -> Vec<LayerSummary> {
        let mut summaries = self.backbone.layer_summaries();
        summaries.extend(self.rpn.layer_summaries());
        summaries.extend(self.classifier.layer_summaries());
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::frcnn::classifier::BoxRegression;
    use crate::models::resnet::stage::StageConfig;
    use crate::models::resnet::stem::ResNetStemConfig;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type B = NdArray<f32>;

    fn tiny_config() -> FasterRcnnConfig {
        FasterRcnnConfig::new(
            BackboneConfig::new(vec![
                StageConfig::new(2, 8, [4, 4, 16], 1).with_stride(1),
                StageConfig::new(3, 16, [8, 8, 24], 1),
            ])
            .with_stem(ResNetStemConfig::new().with_out_channels(8)),
            RpnConfig::new(3)
                .with_in_channels(24)
                .with_hidden_channels(8),
            ClassifierHeadConfig::new(2, 4)
                .with_in_channels(24)
                .with_pool_size(4)
                .with_stage(StageConfig::new(5, 24, [8, 8, 32], 1)),
        )
    }

    #[test]
    fn test_resnet50_config() {
        let config = FasterRcnnConfig::new_resnet50(9, 32, 21);
        config.try_validate().unwrap();
        assert_eq!(config.feature_resolution([224, 224]), Some([14, 14]));
        assert_eq!(config.rpn.num_anchors, 9);
        assert_eq!(config.classifier.num_rois, 32);
        assert_eq!(config.classifier.num_classes, 21);
        assert_eq!(config.classifier.regression, BoxRegression::PerClass);
    }

    #[test]
    fn test_channel_agreement() {
        let mut config = FasterRcnnConfig::new_resnet50(9, 32, 21);
        config.rpn.in_channels = 512;
        assert_eq!(
            config.try_validate(),
            Err(FrcnnError::ChannelMismatch {
                producer: "backbone".to_string(),
                produced: 1024,
                consumer: "rpn".to_string(),
                expected: 512,
            })
        );

        let mut config = tiny_config();
        config.classifier.in_channels = 32;
        config.classifier.stage.in_channels = 32;
        assert!(matches!(
            config.try_validate(),
            Err(FrcnnError::ChannelMismatch { consumer, .. }) if consumer == "classifier"
        ));

        assert!(matches!(
            FasterRcnnConfig::new_resnet50(9, 0, 21).try_init::<B>(&Default::default()),
            Err(FrcnnError::InvalidNumRois(0))
        ));
    }

    #[test]
    fn test_stem_errors_surface_at_construction() {
        let mut config = FasterRcnnConfig::new_resnet50(9, 32, 21);
        config.backbone.stem.stride = 0;
        assert!(matches!(
            config.try_validate(),
            Err(FrcnnError::InvalidConfig { .. })
        ));
        assert_eq!(config.feature_resolution([224, 224]), None);

        let mut config = tiny_config();
        config.backbone.stem.in_channels = 0;
        assert!(config.try_init::<B>(&Default::default()).is_err());
    }

    #[test]
    fn test_tiny_graph() {
        let device = Default::default();
        let config = tiny_config();
        let model: FasterRcnn<B> = config.try_init(&device).unwrap();
        assert_eq!(model.num_anchors(), 3);
        assert_eq!(model.num_rois(), 2);
        assert_eq!(model.num_classes(), 4);

        let features = model.build_backbone(Tensor::zeros([1, 3, 64, 64], &device));
        let [height, width] = config.feature_resolution([64, 64]).unwrap();
        assert_eq!([height, width], [8, 8]);
        assert_shape_contract!(
            ["batch", "channels", "height", "width"],
            &features,
            &[("batch", 1), ("channels", 24), ("height", 8), ("width", 8)],
        );

        let rpn = model.build_rpn(features.clone());
        assert_shape_contract!(
            ["batch", "anchors", "height", "width"],
            &rpn.objectness,
            &[("batch", 1), ("anchors", 3), ("height", 8), ("width", 8)],
        );

        let proposals: Tensor<B, 3> = Tensor::from_data(
            TensorData::new(vec![0.0f32, 0.0, 8.0, 8.0, 2.0, 3.0, 4.0, 2.0], [1, 2, 4]),
            &device,
        );
        let output = model.build_classifier(features.clone(), proposals).unwrap();
        assert_shape_contract!(
            ["batch", "rois", "classes"],
            &output.class_scores,
            &[("batch", 1), ("rois", 2), ("classes", 4)],
        );
        assert_shape_contract!(
            ["batch", "rois", "deltas"],
            &output.box_deltas,
            &[("batch", 1), ("rois", 2), ("deltas", 12)],
        );

        let err = model
            .classify_proposals(features, &[vec![RegionProposal::new(0.0, 0.0, 1.0, 1.0)]])
            .unwrap_err();
        assert_eq!(
            err,
            FrcnnError::RoiCountMismatch {
                image: 0,
                expected: 2,
                actual: 1,
            }
        );
    }

    #[test]
    fn test_layer_registry() {
        let device = Default::default();
        let model: FasterRcnn<B> = tiny_config().try_init(&device).unwrap();
        let summaries = model.layer_summaries();

        let mut names: Vec<&str> = summaries.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names[0], "conv1");
        assert_eq!(names[1], "bn_conv1");
        assert!(names.contains(&"res3b_branch2c"));
        assert!(names.contains(&"rpn_out_regress"));
        assert!(names.contains(&"bn5a_branch1"));
        assert_eq!(names[names.len() - 1], "dense_regress_4");

        // Backbone frozen only when asked.
        assert!(summaries.iter().all(|s| s.trainable));

        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);

        let counted: usize = summaries.iter().map(|s| s.num_params).sum();
        assert_eq!(counted, model.num_params());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frcnn.json");

        let mut config = FasterRcnnConfig::new_resnet50(9, 64, 11);
        config.classifier.regression = BoxRegression::ClassAgnostic;
        config.save(&path).unwrap();

        let loaded = FasterRcnnConfig::load(&path).unwrap();
        assert_eq!(loaded.rpn.num_anchors, 9);
        assert_eq!(loaded.classifier.num_rois, 64);
        assert_eq!(loaded.classifier.num_classes, 11);
        assert_eq!(loaded.classifier.regression, BoxRegression::ClassAgnostic);
        assert_eq!(loaded.backbone.stages.len(), 3);
        assert!(!loaded.backbone.stem.trainable);
        loaded.try_validate().unwrap();
    }
}
