//! Test helpers.
use burn::prelude::{Backend, Tensor};

/// Read a float tensor back as a flat `f32` vector.
pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .expect("tensor data should convert to f32")
}

/// Assert two tensors have equal shapes and element-wise close values.
pub fn assert_close<B: Backend, const D: usize>(
    actual: Tensor<B, D>,
    expected: Tensor<B, D>,
    tolerance: f32,
) {
    assert_eq!(actual.dims(), expected.dims(), "shape mismatch");
    let actual = to_vec(actual);
    let expected = to_vec(expected);
    for (idx, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {idx}: {a} != {e} (tolerance {tolerance})"
        );
    }
}
