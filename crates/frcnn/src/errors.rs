//! # Graph Construction and Input Errors

use thiserror::Error;

/// Errors raised while building or feeding the detector graph.
///
/// Configuration errors surface at construction time, from the
/// `try_validate` / `try_init` methods of the config types.
/// Input errors surface before RoI pooling executes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrcnnError {
    /// A residual addition would combine tensors of different shapes.
    #[error("shape mismatch at {layer}: {message}")]
    ShapeMismatch {
        /// The layer name where the addition happens.
        layer: String,
        /// What disagrees.
        message: String,
    },

    /// A structurally invalid configuration.
    #[error("invalid config for {layer}: {message}")]
    InvalidConfig {
        /// The offending layer or component.
        layer: String,
        /// What is wrong.
        message: String,
    },

    /// Kernel sizes must be odd and non-zero for same-size padding.
    #[error("unsupported kernel size {kernel_size} at {layer}; expected an odd size")]
    UnsupportedKernel {
        /// The offending layer.
        layer: String,
        /// The rejected kernel size.
        kernel_size: usize,
    },

    /// Adjacent components disagree on channel count.
    #[error("channel mismatch: {producer} emits {produced} channels, {consumer} expects {expected}")]
    ChannelMismatch {
        /// The producing component.
        producer: String,
        /// Channels produced.
        produced: usize,
        /// The consuming component.
        consumer: String,
        /// Channels expected.
        expected: usize,
    },

    /// `num_rois` must be at least 1.
    #[error("num_rois must be positive, got {0}")]
    InvalidNumRois(usize),

    /// The number of proposals for an image does not match `num_rois`.
    #[error("image {image}: expected {expected} proposals, got {actual}")]
    RoiCountMismatch {
        /// Image index in the batch.
        image: usize,
        /// Configured `num_rois`.
        expected: usize,
        /// Proposals supplied.
        actual: usize,
    },

    /// A proposal with non-positive or non-finite extent.
    #[error("image {image}, proposal {index}: degenerate region {region:?}")]
    DegenerateProposal {
        /// Image index in the batch.
        image: usize,
        /// Proposal index within the image.
        index: usize,
        /// The rejected ``[x, y, width, height]``.
        region: [f32; 4],
    },

    /// The proposal tensor is malformed or unreadable.
    #[error("invalid proposal tensor: {0}")]
    InvalidProposalTensor(String),
}

/// Crate result alias.
///
/// Referenced as `errors::Result`; importing it bare shadows the
/// two-argument `Result` that burn's `Config` derive expands to.
pub type Result<T> = std::result::Result<T, FrcnnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = FrcnnError::ChannelMismatch {
            producer: "backbone".to_string(),
            produced: 1024,
            consumer: "rpn".to_string(),
            expected: 512,
        };
        assert_eq!(
            err.to_string(),
            "channel mismatch: backbone emits 1024 channels, rpn expects 512"
        );

        let err = FrcnnError::DegenerateProposal {
            image: 0,
            index: 3,
            region: [1.0, 2.0, 0.0, 4.0],
        };
        assert_eq!(
            err.to_string(),
            "image 0, proposal 3: degenerate region [1.0, 2.0, 0.0, 4.0]"
        );
    }
}
