//! # Convolution Shape Utilities
//!
//! Output-size arithmetic for square-kernel convolutions and pools,
//! used to predict feature-map resolutions without running the graph.

/// Predict the output size of a 1D convolution (or pooling) window.
///
/// ```text
/// out_size = floor( (in_size + 2*padding - kernel_size) / stride ) + 1
/// ```
///
/// # Arguments
///
/// - `input_size`: The input dimension size, must be > 0.
/// - `kernel_size`: The kernel size, must be > 0.
/// - `stride`: The stride of the window, must be > 0.
/// - `padding`: Padding added evenly to both sides of the input.
///
/// # Returns
///
/// The output size; or `None` if the window does not fit.
pub fn maybe_conv_output_size(
    input_size: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
) -> Option<usize> {
    assert!(kernel_size > 0);
    assert!(stride > 0);

    let effective_size = input_size + 2 * padding;
    if input_size == 0 || effective_size < kernel_size {
        return None;
    }
    Some((effective_size - kernel_size) / stride + 1)
}

/// Predict the output resolution of a square-window 2D convolution or pool.
///
/// # Returns
///
/// ``[out_height, out_width]``; or `None` if the window does not fit.
pub fn maybe_conv2d_output_resolution(
    input_resolution: [usize; 2],
    kernel_size: usize,
    stride: usize,
    padding: usize,
) -> Option<[usize; 2]> {
    let [height, width] = input_resolution;
    Some([
        maybe_conv_output_size(height, kernel_size, stride, padding)?,
        maybe_conv_output_size(width, kernel_size, stride, padding)?,
    ])
}

/// The resolution after a strided unit: ``ceil(in / stride)`` per axis.
///
/// Equivalent to a 1x1 convolution with the given stride and no padding;
/// and to a ``k x k`` convolution with padding ``k / 2`` for odd ``k``.
///
/// # Panics
///
/// If `stride` is zero.
pub fn stride_ceil_output_resolution(
    input_resolution: [usize; 2],
    stride: usize,
) -> [usize; 2] {
    assert!(stride > 0, "stride must be positive");
    input_resolution.map(|size| size.div_ceil(stride))
}
