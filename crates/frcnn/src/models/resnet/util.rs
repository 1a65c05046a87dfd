//! # `ResNet` Utilities
use burn::nn::Initializer;

/// Initializer for convolutions feeding a rectifier.
///
/// Kaiming-normal, fan-out mode, ``gain = sqrt(2)``.
pub const CONV_INTO_RELU_INITIALIZER: Initializer = Initializer::KaimingNormal {
    gain: std::f64::consts::SQRT_2,
    fan_out_only: true,
};

/// The ``'normal'`` initializer of the detector heads: ``N(0, 0.05)``.
pub const HEAD_NORMAL_INITIALIZER: Initializer = Initializer::Normal {
    mean: 0.0,
    std: 0.05,
};

/// The ``'uniform'`` initializer of the detector heads: ``U(-0.05, 0.05)``.
pub const HEAD_UNIFORM_INITIALIZER: Initializer = Initializer::Uniform {
    min: -0.05,
    max: 0.05,
};

/// Same-size padding for an odd square kernel.
///
/// Returns `None` for even (or zero) kernels, which have no
/// symmetric same-size padding.
pub fn same_padding(kernel_size: usize) -> Option<usize> {
    if kernel_size % 2 == 1 {
        Some(kernel_size / 2)
    } else {
        None
    }
}
