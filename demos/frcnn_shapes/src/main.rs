use anyhow::{Context, anyhow};
use burn::backend::NdArray;
use burn::config::Config;
use burn::prelude::Tensor;
use clap::{Parser, ValueEnum};
use frcnn::layers::pool::roi_pool::{RegionProposal, RoiPoolingMode};
use frcnn::models::frcnn::classifier::BoxRegression;
use frcnn::models::frcnn::detector::{FasterRcnn, FasterRcnnConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

type B = NdArray<f32>;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PoolMode {
    Max,
    Average,
}

impl From<PoolMode> for RoiPoolingMode {
    fn from(mode: PoolMode) -> Self {
        match mode {
            PoolMode::Max => RoiPoolingMode::Max,
            PoolMode::Average => RoiPoolingMode::Average,
        }
    }
}

// $ --image-height=600 --image-width=800 --rois=16 --list-layers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Image height.
    #[arg(long, default_value_t = 224)]
    image_height: usize,

    /// Image width.
    #[arg(long, default_value_t = 224)]
    image_width: usize,

    /// Anchors per feature-map position.
    #[arg(long, default_value_t = 9)]
    anchors: usize,

    /// Proposals per image.
    #[arg(long, default_value_t = 32)]
    rois: usize,

    /// Classes, background included.
    #[arg(long, default_value_t = 21)]
    classes: usize,

    /// RoI pooling bin reduction.
    #[arg(long, value_enum, default_value_t = PoolMode::Max)]
    pool_mode: PoolMode,

    /// Predict one shared box per region, rather than one per class.
    #[arg(long)]
    class_agnostic: bool,

    /// Load the detector config from JSON; overrides the shape flags.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Save the effective detector config as JSON.
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Print the layer registry.
    #[arg(long)]
    list_layers: bool,

    /// Log filter, when ``RUST_LOG`` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_target(true)
        .init();

    let config = match &args.config {
        Some(path) => FasterRcnnConfig::load(path)
            .map_err(|err| anyhow!("loading {}: {err:?}", path.display()))?,
        None => {
            let mut config = FasterRcnnConfig::new_resnet50(args.anchors, args.rois, args.classes);
            config.classifier.pool_mode = args.pool_mode.into();
            if args.class_agnostic {
                config.classifier.regression = BoxRegression::ClassAgnostic;
            }
            config
        }
    };
    config.try_validate()?;

    if let Some(path) = &args.save_config {
        config
            .save(path)
            .with_context(|| format!("saving {}", path.display()))?;
        tracing::info!(path = %path.display(), "saved config");
    }

    let image_resolution = [args.image_height, args.image_width];
    let [height, width] = config
        .feature_resolution(image_resolution)
        .ok_or_else(|| anyhow!("image {image_resolution:?} is too small for the backbone"))?;

    let device = Default::default();
    let model: FasterRcnn<B> = config.try_init(&device)?;

    if args.list_layers {
        for layer in model.layer_summaries() {
            println!(
                "{:<20} {:>10} {}",
                layer.name,
                layer.num_params,
                if layer.trainable { "trainable" } else { "frozen" }
            );
        }
    }

    let image: Tensor<B, 4> = Tensor::zeros([1, 3, args.image_height, args.image_width], &device);
    tracing::info!(dims = ?image.dims(), "image");

    let features = model.build_backbone(image);
    tracing::info!(dims = ?features.dims(), "feature map");

    let rpn = model.build_rpn(features.clone());
    tracing::info!(dims = ?rpn.objectness.dims(), "rpn objectness");
    tracing::info!(dims = ?rpn.deltas.dims(), "rpn deltas");

    let proposals = grid_proposals(model.num_rois(), [height, width]);
    let output = model.classify_proposals(features, &[proposals])?;
    tracing::info!(dims = ?output.class_scores.dims(), "class scores");
    tracing::info!(dims = ?output.box_deltas.dims(), "box deltas");

    Ok(())
}

/// Tile the feature map with `count` proposals, row-major.
fn grid_proposals(
    count: usize,
    map_size: [usize; 2],
) -> Vec<RegionProposal> {
    let side = (count as f64).sqrt().ceil() as usize;
    let cell_height = map_size[0] as f32 / side as f32;
    let cell_width = map_size[1] as f32 / side as f32;
    (0..count)
        .map(|idx| {
            let (row, col) = (idx / side, idx % side);
            RegionProposal::new(
                col as f32 * cell_width,
                row as f32 * cell_height,
                cell_width,
                cell_height,
            )
        })
        .collect()
}
