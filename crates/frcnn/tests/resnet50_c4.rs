//! End-to-end shape checks on the full-size `ResNet-50` C4 graph.

use bimm_contracts::assert_shape_contract;
use burn::backend::NdArray;
use burn::prelude::Tensor;
use frcnn::layers::pool::roi_pool::RegionProposal;
use frcnn::models::frcnn::detector::{FasterRcnn, FasterRcnnConfig};

type B = NdArray<f32>;

#[test]
fn test_resnet50_c4_graph_on_zero_image() {
    let device = Default::default();
    let config = FasterRcnnConfig::new_resnet50(9, 2, 21);
    let model: FasterRcnn<B> = config.try_init(&device).unwrap();

    let features = model.build_backbone(Tensor::zeros([1, 3, 224, 224], &device));
    assert_shape_contract!(
        ["batch", "channels", "height", "width"],
        &features,
        &[
            ("batch", 1),
            ("channels", 1024),
            ("height", 14),
            ("width", 14)
        ],
    );

    let rpn = model.build_rpn(features.clone());
    assert_shape_contract!(
        ["batch", "anchors", "height", "width"],
        &rpn.objectness,
        &[("batch", 1), ("anchors", 9), ("height", 14), ("width", 14)],
    );
    assert_shape_contract!(
        ["batch", "deltas", "height", "width"],
        &rpn.deltas,
        &[("batch", 1), ("deltas", 36), ("height", 14), ("width", 14)],
    );

    let proposals = vec![vec![
        RegionProposal::new(0.0, 0.0, 14.0, 14.0),
        RegionProposal::new(3.0, 4.0, 5.0, 6.0),
    ]];
    let output = model.classify_proposals(features, &proposals).unwrap();
    assert_shape_contract!(
        ["batch", "rois", "classes"],
        &output.class_scores,
        &[("batch", 1), ("rois", 2), ("classes", 21)],
    );
    assert_shape_contract!(
        ["batch", "rois", "deltas"],
        &output.box_deltas,
        &[("batch", 1), ("rois", 2), ("deltas", 80)],
    );
}

#[test]
fn test_resnet50_c4_registry() {
    let device = Default::default();
    let model: FasterRcnn<B> = FasterRcnnConfig::new_resnet50(9, 4, 21)
        .try_init(&device)
        .unwrap();
    let summaries = model.layer_summaries();

    let backbone: Vec<_> = summaries
        .iter()
        .take_while(|s| !s.name.starts_with("rpn_"))
        .collect();
    assert!(backbone.iter().all(|s| !s.trainable));
    assert_eq!(backbone.last().map(|s| s.name.as_str()), Some("bn4f_branch2c"));

    let names: Vec<&str> = summaries.iter().map(|s| s.name.as_str()).collect();
    for name in [
        "conv1",
        "bn_conv1",
        "res2a_branch1",
        "res3d_branch2b",
        "res4f_branch2a",
        "rpn_conv1",
        "rpn_out_class",
        "res5c_branch2c",
        "dense_class_21",
        "dense_regress_21",
    ] {
        assert!(names.contains(&name), "missing {name}");
    }
}
