//! # Region of Interest Pooling
//!
//! [`RoiPool2d`] maps a fixed number of proposal regions per image, each of
//! arbitrary size, onto fixed ``pool_size x pool_size`` grids sampled from a
//! shared feature map.
//!
//! Proposals are ``(x, y, width, height)`` in feature-map units. Each one is
//! rounded to whole pixels, clipped to the map, and split into bins; bin
//! ``i`` along an axis of extent ``n`` starting at ``o`` covers
//!
//! ```text
//! [o + floor(i * n / p), o + ceil((i + 1) * n / p))
//! ```
//!
//! so bins are never empty, and overlap when ``n < p``. Each bin is reduced
//! per channel by [`RoiPoolingMode`]. Both reductions are separable over a
//! rectangular bin, so rows are reduced first, then columns.

use crate::errors::{self, FrcnnError};
use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::prelude::{Backend, Tensor};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Default pooled grid size.
pub const DEFAULT_POOL_SIZE: usize = 14;

/// A proposal region in feature-map coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionProposal {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Horizontal extent.
    pub width: f32,
    /// Vertical extent.
    pub height: f32,
}

impl RegionProposal {
    /// Create a new proposal.
    pub fn new(
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    ) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// ``[x, y, width, height]``.
    pub fn to_array(&self) -> [f32; 4] {
        [self.x, self.y, self.width, self.height]
    }

    /// Is this a usable region?
    ///
    /// All coordinates finite; extents strictly positive.
    pub fn is_valid(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite()) && self.width > 0.0 && self.height > 0.0
    }

    /// Resolve the pixel window for a ``[height, width]`` map.
    ///
    /// The region must be valid; see [`RegionProposal::is_valid`].
    pub fn window(
        &self,
        map_size: [usize; 2],
    ) -> PoolWindow {
        let [map_height, map_width] = map_size;
        let (rows, rows_clipped) = clip_span(self.y, self.y + self.height, map_height);
        let (cols, cols_clipped) = clip_span(self.x, self.x + self.width, map_width);
        PoolWindow {
            rows,
            cols,
            clipped: rows_clipped || cols_clipped,
        }
    }
}

impl From<[f32; 4]> for RegionProposal {
    fn from(value: [f32; 4]) -> Self {
        let [x, y, width, height] = value;
        Self::new(x, y, width, height)
    }
}

/// A resolved, non-empty pixel window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolWindow {
    /// Row range.
    pub rows: Range<usize>,
    /// Column range.
    pub cols: Range<usize>,
    /// Whether the window was clipped to the map, or clamped to one pixel.
    ///
    /// Rounding alone does not set this.
    pub clipped: bool,
}

/// Round ``[start, end)`` to whole pixels and clip to ``[0, limit]``.
///
/// Empty results are clamped to one pixel inside the map.
fn clip_span(
    start: f32,
    end: f32,
    limit: usize,
) -> (Range<usize>, bool) {
    let lo = start.round();
    let hi = end.round();
    let clip = |v: f32| v.clamp(0.0, limit as f32) as usize;

    let mut first = clip(lo);
    let mut last = clip(hi);
    let mut clipped = lo < 0.0 || hi > limit as f32;
    if last <= first {
        first = first.min(limit - 1);
        last = first + 1;
        clipped = true;
    }
    (first..last, clipped)
}

/// Bounds of bin ``index`` for a span split into ``pool_size`` bins.
pub fn bin_range(
    span: &Range<usize>,
    pool_size: usize,
    index: usize,
) -> Range<usize> {
    let extent = span.end - span.start;
    let start = span.start + (index * extent) / pool_size;
    let end = span.start + ((index + 1) * extent).div_ceil(pool_size);
    start..end
}

/// Per-bin reduction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoiPoolingMode {
    /// Maximum over the bin.
    #[default]
    Max,

    /// Mean over the bin.
    Average,
}

/// [`RoiPool2d`] Config.
#[derive(Config, Debug)]
pub struct RoiPool2dConfig {
    /// Proposals per image.
    pub num_rois: usize,

    /// Output grid size.
    #[config(default = "DEFAULT_POOL_SIZE")]
    pub pool_size: usize,

    /// Bin reduction.
    #[config(default = "RoiPoolingMode::Max")]
    pub mode: RoiPoolingMode,
}

impl RoiPool2dConfig {
    /// Check if the config is valid.
    pub fn try_validate(&self) -> errors::Result<()> {
        if self.num_rois == 0 {
            return Err(FrcnnError::InvalidNumRois(self.num_rois));
        }
        if self.pool_size == 0 {
            return Err(FrcnnError::InvalidConfig {
                layer: "roi_pool".to_string(),
                message: "pool_size must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Initialize a [`RoiPool2d`].
    pub fn try_init(&self) -> errors::Result<RoiPool2d> {
        self.try_validate()?;
        Ok(RoiPool2d {
            num_rois: self.num_rois,
            pool_size: self.pool_size,
            mode: Ignored(self.mode),
        })
    }

    /// Initialize a [`RoiPool2d`].
    ///
    /// # Panics
    ///
    /// If the config is invalid.
    pub fn init(&self) -> RoiPool2d {
        match self.try_init() {
            Ok(pool) => pool,
            Err(err) => panic!("{err}"),
        }
    }
}

/// Region of Interest pooling.
#[derive(Module, Clone, Debug)]
pub struct RoiPool2d {
    /// Proposals per image.
    pub num_rois: usize,

    /// Output grid size.
    pub pool_size: usize,

    /// Bin reduction.
    pub mode: Ignored<RoiPoolingMode>,
}

impl RoiPool2d {
    /// The bin reduction.
    pub fn mode(&self) -> RoiPoolingMode {
        *self.mode
    }

    /// Pool proposals given as a ``[batch, num_rois, 4]`` tensor.
    ///
    /// Rows are ``[x, y, width, height]`` in feature-map units.
    ///
    /// # Returns
    ///
    /// ``[batch, num_rois, channels, pool_size, pool_size]``
    pub fn forward<B: Backend>(
        &self,
        features: Tensor<B, 4>,
        proposals: Tensor<B, 3>,
    ) -> errors::Result<Tensor<B, 5>> {
        let regions = self.read_proposals(&features, proposals)?;
        self.pool(features, &regions)
    }

    /// Pool proposals given per image.
    ///
    /// Every proposal is checked before any pooling runs.
    ///
    /// # Arguments
    ///
    /// - `features`: ``[batch, channels, height, width]``.
    /// - `proposals`: one list of exactly `num_rois` regions per image.
    ///
    /// # Returns
    ///
    /// ``[batch, num_rois, channels, pool_size, pool_size]``
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn pool<B: Backend>(
        &self,
        features: Tensor<B, 4>,
        proposals: &[Vec<RegionProposal>],
    ) -> errors::Result<Tensor<B, 5>> {
        let [batch, channels, height, width] = features.dims();
        if proposals.len() != batch {
            return Err(FrcnnError::InvalidProposalTensor(format!(
                "{} proposal lists for a batch of {batch}",
                proposals.len()
            )));
        }

        let windows = self.resolve_windows(proposals, [height, width])?;

        let mut pooled = Vec::with_capacity(batch * self.num_rois);
        for (image, image_windows) in windows.iter().enumerate() {
            let image_features = features
                .clone()
                .slice([image..image + 1, 0..channels, 0..height, 0..width]);
            for window in image_windows {
                pooled.push(self.pool_window(image_features.clone(), window));
            }
        }

        let p = self.pool_size;
        Ok(Tensor::cat(pooled, 0).reshape([batch, self.num_rois, channels, p, p]))
    }

    /// Validate and resolve all windows.
    fn resolve_windows(
        &self,
        proposals: &[Vec<RegionProposal>],
        map_size: [usize; 2],
    ) -> errors::Result<Vec<Vec<PoolWindow>>> {
        proposals
            .iter()
            .enumerate()
            .map(|(image, regions)| {
                if regions.len() != self.num_rois {
                    return Err(FrcnnError::RoiCountMismatch {
                        image,
                        expected: self.num_rois,
                        actual: regions.len(),
                    });
                }
                regions
                    .iter()
                    .enumerate()
                    .map(|(index, region)| {
                        if !region.is_valid() {
                            return Err(FrcnnError::DegenerateProposal {
                                image,
                                index,
                                region: region.to_array(),
                            });
                        }
                        let window = region.window(map_size);
                        if window.clipped {
                            tracing::trace!(
                                image,
                                index,
                                ?region,
                                rows = ?window.rows,
                                cols = ?window.cols,
                                "clipped proposal to feature map"
                            );
                        }
                        Ok(window)
                    })
                    .collect::<errors::Result<Vec<_>>>()
            })
            .collect()
    }

    /// Pool one window of a ``[1, channels, height, width]`` map.
    fn pool_window<B: Backend>(
        &self,
        features: Tensor<B, 4>,
        window: &PoolWindow,
    ) -> Tensor<B, 4> {
        let [_, channels, _, _] = features.dims();
        let region = features.slice([
            0..1,
            0..channels,
            window.rows.clone(),
            window.cols.clone(),
        ]);
        let region_rows = 0..window.rows.len();
        let region_cols = 0..window.cols.len();

        let rows = (0..self.pool_size)
            .map(|i| {
                let bin = bin_range(&region_rows, self.pool_size, i);
                self.reduce(
                    region
                        .clone()
                        .slice([0..1, 0..channels, bin, region_cols.clone()]),
                    2,
                )
            })
            .collect();
        let rows = Tensor::cat(rows, 2);

        let cols = (0..self.pool_size)
            .map(|j| {
                let bin = bin_range(&region_cols, self.pool_size, j);
                self.reduce(
                    rows.clone()
                        .slice([0..1, 0..channels, 0..self.pool_size, bin]),
                    3,
                )
            })
            .collect();
        Tensor::cat(cols, 3)
    }

    fn reduce<B: Backend>(
        &self,
        bin: Tensor<B, 4>,
        dim: usize,
    ) -> Tensor<B, 4> {
        match self.mode() {
            RoiPoolingMode::Max => bin.max_dim(dim),
            RoiPoolingMode::Average => bin.mean_dim(dim),
        }
    }

    /// Read a ``[batch, num_rois, 4]`` proposal tensor.
    fn read_proposals<B: Backend>(
        &self,
        features: &Tensor<B, 4>,
        proposals: Tensor<B, 3>,
    ) -> errors::Result<Vec<Vec<RegionProposal>>> {
        let [batch, num_rois, coords] = proposals.dims();
        let feature_batch = features.dims()[0];
        if coords != 4 || batch != feature_batch {
            return Err(FrcnnError::InvalidProposalTensor(format!(
                "expected [{feature_batch}, num_rois, 4], got {:?}",
                [batch, num_rois, coords]
            )));
        }
        let values = proposals
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| FrcnnError::InvalidProposalTensor(format!("{err:?}")))?;
        if num_rois == 0 {
            return Ok(vec![Vec::new(); batch]);
        }

        Ok(values
            .chunks_exact(num_rois * 4)
            .map(|image| {
                image
                    .chunks_exact(4)
                    .map(|row| RegionProposal::new(row[0], row[1], row[2], row[3]))
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_close, to_vec};
    use bimm_contracts::assert_shape_contract;
    use burn::backend::NdArray;
    use burn::nn::pool::{AvgPool2dConfig, MaxPool2dConfig};
    use burn::tensor::{Distribution, TensorData};

    type B = NdArray<f32>;

    fn full_map(size: usize) -> RegionProposal {
        RegionProposal::new(0.0, 0.0, size as f32, size as f32)
    }

    #[test]
    fn test_config() {
        let config = RoiPool2dConfig::new(32);
        assert_eq!(config.pool_size, 14);
        assert_eq!(config.mode, RoiPoolingMode::Max);

        let pool = config.init();
        assert_eq!(pool.num_rois, 32);
        assert_eq!(pool.mode(), RoiPoolingMode::Max);

        assert_eq!(
            RoiPool2dConfig::new(0).try_validate(),
            Err(FrcnnError::InvalidNumRois(0))
        );
        assert!(matches!(
            RoiPool2dConfig::new(1).with_pool_size(0).try_init(),
            Err(FrcnnError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_config_serde() {
        let config = RoiPool2dConfig::new(8)
            .with_pool_size(7)
            .with_mode(RoiPoolingMode::Average);
        let json = serde_json::to_string(&config).unwrap();
        let loaded: RoiPool2dConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.num_rois, 8);
        assert_eq!(loaded.pool_size, 7);
        assert_eq!(loaded.mode, RoiPoolingMode::Average);
        assert_eq!(loaded.try_init().unwrap().num_rois, 8);
    }

    #[test]
    #[should_panic(expected = "num_rois must be positive")]
    fn test_init_panics() {
        let _ = RoiPool2dConfig::new(0).init();
    }

    #[test]
    fn test_bin_range() {
        let span = 3..10;
        let bins: Vec<Range<usize>> = (0..3).map(|i| bin_range(&span, 3, i)).collect();
        assert_eq!(bins, vec![3..6, 5..8, 7..10]);

        // Extent smaller than the grid: overlapping, never empty.
        let span = 0..2;
        let bins: Vec<Range<usize>> = (0..4).map(|i| bin_range(&span, 4, i)).collect();
        assert_eq!(bins, vec![0..1, 0..1, 1..2, 1..2]);

        let span = 0..8;
        let bins: Vec<Range<usize>> = (0..4).map(|i| bin_range(&span, 4, i)).collect();
        assert_eq!(bins, vec![0..2, 2..4, 4..6, 6..8]);
    }

    #[test]
    fn test_window_rounding_and_clipping() {
        let window = RegionProposal::new(1.4, 2.5, 3.2, 2.0).window([10, 10]);
        assert_eq!(window.rows, 3..5);
        assert_eq!(window.cols, 1..5);
        assert!(!window.clipped);

        // Rounding moves the window without flagging it.
        let window = RegionProposal::new(0.6, 0.6, 2.0, 2.0).window([8, 8]);
        assert_eq!(window.rows, 1..3);
        assert_eq!(window.cols, 1..3);
        assert!(!window.clipped);

        let window = RegionProposal::new(-3.0, 6.0, 20.0, 8.0).window([8, 10]);
        assert_eq!(window.rows, 6..8);
        assert_eq!(window.cols, 0..10);
        assert!(window.clipped);

        // Entirely outside: a single pixel at the edge.
        let window = RegionProposal::new(12.0, 12.0, 2.0, 2.0).window([8, 8]);
        assert_eq!(window.rows, 7..8);
        assert_eq!(window.cols, 7..8);
        assert!(window.clipped);

        // Rounds to nothing.
        let window = RegionProposal::new(2.0, 2.0, 0.2, 0.2).window([8, 8]);
        assert_eq!(window.rows, 2..3);
        assert_eq!(window.cols, 2..3);
    }

    #[test]
    fn test_pool_shape() {
        let device = Default::default();
        let pool = RoiPool2dConfig::new(3).with_pool_size(4).init();

        let features: Tensor<B, 4> = Tensor::random([2, 5, 9, 7], Distribution::Default, &device);
        let proposals = vec![
            vec![
                RegionProposal::new(0.0, 0.0, 2.0, 2.0),
                RegionProposal::new(1.0, 2.0, 5.0, 6.0),
                full_map(9),
            ],
            vec![
                RegionProposal::new(3.5, 0.5, 1.0, 8.0),
                RegionProposal::new(6.0, 8.0, 1.0, 1.0),
                RegionProposal::new(-1.0, -1.0, 30.0, 30.0),
            ],
        ];
        let output = pool.pool(features, &proposals).unwrap();
        assert_shape_contract!(
            ["batch", "rois", "channels", "h", "w"],
            &output,
            &[
                ("batch", 2),
                ("rois", 3),
                ("channels", 5),
                ("h", 4),
                ("w", 4)
            ],
        );
    }

    #[test]
    fn test_full_map_is_grid_downsample() {
        let device = Default::default();
        let features: Tensor<B, 4> = Tensor::random([1, 3, 8, 8], Distribution::Default, &device);

        let pool = RoiPool2dConfig::new(1).with_pool_size(4).init();
        let output = pool.pool(features.clone(), &[vec![full_map(8)]]).unwrap();
        let expected = MaxPool2dConfig::new([2, 2])
            .with_strides([2, 2])
            .init()
            .forward(features.clone());
        assert_close(output.reshape([1, 3, 4, 4]), expected, 1e-6);

        let pool = RoiPool2dConfig::new(1)
            .with_pool_size(4)
            .with_mode(RoiPoolingMode::Average)
            .init();
        let output = pool.pool(features.clone(), &[vec![full_map(8)]]).unwrap();
        let expected = AvgPool2dConfig::new([2, 2])
            .with_strides([2, 2])
            .init()
            .forward(features);
        assert_close(output.reshape([1, 3, 4, 4]), expected, 1e-5);
    }

    #[test]
    fn test_max_pool_values() {
        let device = Default::default();
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let features: Tensor<B, 4> =
            Tensor::from_data(TensorData::new(values, [1, 1, 4, 4]), &device);

        let pool = RoiPool2dConfig::new(2).with_pool_size(2).init();
        let proposals = vec![vec![
            full_map(4),
            RegionProposal::new(1.0, 1.0, 2.0, 2.0),
        ]];
        let output = pool.pool(features, &proposals).unwrap();
        assert_eq!(
            to_vec(output),
            vec![5.0, 7.0, 13.0, 15.0, 5.0, 6.0, 9.0, 10.0]
        );
    }

    #[test]
    fn test_identical_proposals_and_determinism() {
        let device = Default::default();
        let features: Tensor<B, 4> = Tensor::random([1, 4, 10, 12], Distribution::Default, &device);
        let region = RegionProposal::new(2.3, 1.7, 6.1, 5.4);

        let pool = RoiPool2dConfig::new(2).with_pool_size(3).init();
        let proposals = vec![vec![region, region]];
        let output = pool.pool(features.clone(), &proposals).unwrap();

        let first = output.clone().slice([0..1, 0..1, 0..4, 0..3, 0..3]);
        let second = output.clone().slice([0..1, 1..2, 0..4, 0..3, 0..3]);
        first.into_data().assert_eq(&second.into_data(), true);

        let again = pool.pool(features, &proposals).unwrap();
        output.into_data().assert_eq(&again.into_data(), true);
    }

    #[test]
    fn test_outside_proposal_samples_edge_pixel() {
        let device = Default::default();
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let features: Tensor<B, 4> =
            Tensor::from_data(TensorData::new(values, [1, 1, 4, 4]), &device);

        let pool = RoiPool2dConfig::new(1).with_pool_size(2).init();
        let output = pool
            .pool(features, &[vec![RegionProposal::new(9.0, 9.0, 3.0, 3.0)]])
            .unwrap();
        assert_eq!(to_vec(output), vec![15.0; 4]);
    }

    #[test]
    fn test_tensor_proposals_match_slices() {
        let device = Default::default();
        let features: Tensor<B, 4> = Tensor::random([2, 3, 8, 8], Distribution::Default, &device);
        let rows = [
            [0.0, 0.0, 4.0, 4.0],
            [2.0, 1.0, 5.0, 6.0],
            [1.0, 1.0, 1.0, 1.0],
            [0.0, 3.0, 8.0, 2.0],
        ];
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let tensor: Tensor<B, 3> = Tensor::from_data(TensorData::new(flat, [2, 2, 4]), &device);

        let pool = RoiPool2dConfig::new(2).with_pool_size(2).init();
        let from_tensor = pool.forward(features.clone(), tensor).unwrap();

        let proposals: Vec<Vec<RegionProposal>> = rows
            .chunks(2)
            .map(|image| image.iter().map(|&row| row.into()).collect())
            .collect();
        let from_slices = pool.pool(features, &proposals).unwrap();
        from_tensor
            .into_data()
            .assert_eq(&from_slices.into_data(), true);
    }

    #[test]
    fn test_degenerate_proposals_rejected() {
        let device = Default::default();
        let features: Tensor<B, 4> = Tensor::zeros([1, 1, 4, 4], &device);
        let pool = RoiPool2dConfig::new(2).with_pool_size(2).init();

        let proposals = vec![vec![full_map(4), RegionProposal::new(1.0, 1.0, 0.0, 2.0)]];
        assert_eq!(
            pool.pool(features.clone(), &proposals).unwrap_err(),
            FrcnnError::DegenerateProposal {
                image: 0,
                index: 1,
                region: [1.0, 1.0, 0.0, 2.0],
            }
        );

        let proposals = vec![vec![RegionProposal::new(f32::NAN, 0.0, 1.0, 1.0), full_map(4)]];
        assert!(matches!(
            pool.pool(features.clone(), &proposals),
            Err(FrcnnError::DegenerateProposal { index: 0, .. })
        ));

        let proposals = vec![vec![full_map(4), RegionProposal::new(0.0, 0.0, 2.0, -1.0)]];
        assert!(matches!(
            pool.pool(features, &proposals),
            Err(FrcnnError::DegenerateProposal { index: 1, .. })
        ));
    }

    #[test]
    fn test_count_mismatch() {
        let device = Default::default();
        let features: Tensor<B, 4> = Tensor::zeros([2, 1, 4, 4], &device);
        let pool = RoiPool2dConfig::new(2).with_pool_size(2).init();

        let proposals = vec![vec![full_map(4); 2], vec![full_map(4); 3]];
        assert_eq!(
            pool.pool(features.clone(), &proposals).unwrap_err(),
            FrcnnError::RoiCountMismatch {
                image: 1,
                expected: 2,
                actual: 3,
            }
        );

        let proposals = vec![vec![full_map(4); 2]];
        assert!(matches!(
            pool.pool(features.clone(), &proposals),
            Err(FrcnnError::InvalidProposalTensor(_))
        ));

        let tensor: Tensor<B, 3> = Tensor::zeros([2, 2, 3], &device);
        assert!(matches!(
            pool.forward(features, tensor),
            Err(FrcnnError::InvalidProposalTensor(_))
        ));
    }
}
