//! # Region-Batched Evaluation
//!
//! The classifier head runs one learned stage over every pooled region.
//! Rather than wrapping each layer in a per-region container, region-batched
//! tensors carry the region axis as a first-class dimension:
//!
//! ```text
//! [batch, regions, channels, height, width]
//! ```
//!
//! [`RegionBatched::forward_regions`] folds ``batch * regions`` into the
//! convolution batch axis, runs the single-image forward, and unfolds the
//! result. The same parameter objects serve both modes; regions never share
//! information, and region order is preserved.

use bimm_contracts::unpack_shape_contract;
use burn::prelude::{Backend, Tensor};

/// Fold ``[batch, regions, c, h, w]`` into ``[batch * regions, c, h, w]``.
///
/// # Returns
///
/// The folded tensor and the ``[batch, regions]`` prefix needed to unfold it.
pub fn fold_regions<B: Backend>(input: Tensor<B, 5>) -> (Tensor<B, 4>, [usize; 2]) {
    let [batch, regions, channels, height, width] = input.dims();
    (
        input.reshape([batch * regions, channels, height, width]),
        [batch, regions],
    )
}

/// Unfold ``[batch * regions, c, h, w]`` into ``[batch, regions, c, h, w]``.
///
/// # Panics
///
/// If the leading axis is not ``batch * regions``.
pub fn unfold_regions<B: Backend>(
    input: Tensor<B, 4>,
    prefix: [usize; 2],
) -> Tensor<B, 5> {
    let [batch, regions] = prefix;
    let [channels, height, width] = unpack_shape_contract!(
        ["items" = "batch" * "regions", "channels", "height", "width"],
        &input,
        &["channels", "height", "width"],
        &[("batch", batch), ("regions", regions)]
    );
    input.reshape([batch, regions, channels, height, width])
}

/// Apply a single-image transform independently to every region.
pub fn map_regions<B: Backend, F>(
    input: Tensor<B, 5>,
    f: F,
) -> Tensor<B, 5>
where
    F: FnOnce(Tensor<B, 4>) -> Tensor<B, 4>,
{
    let (folded, prefix) = fold_regions(input);
    unfold_regions(f(folded), prefix)
}

/// A module usable in both single-image and region-batched mode,
/// with one shared parameter set.
pub trait RegionBatched<B: Backend> {
    /// Single-image forward.
    ///
    /// ``[batch, c_in, h, w] -> [batch, c_out, h', w']``
    fn forward_image(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4>;

    /// Region-batched forward.
    ///
    /// ``[batch, regions, c_in, h, w] -> [batch, regions, c_out, h', w']``
    fn forward_regions(
        &self,
        input: Tensor<B, 5>,
    ) -> Tensor<B, 5> {
        map_regions(input, |x| self.forward_image(x))
    }
}
