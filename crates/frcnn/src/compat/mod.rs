//! Wrappers over ``burn::nn`` layer families, selectable by config.
pub mod activation_wrapper;
pub mod normalization_wrapper;
pub mod conv_shape;
