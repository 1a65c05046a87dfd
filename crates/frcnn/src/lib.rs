#![warn(missing_docs)]
//!# frcnn - Faster R-CNN for Burn
//!
//! The computational graph of a two-stage region-based detector, built on a
//! `ResNet-50` C4 backbone.
//!
//! ## Notable Components
//!
//! * [`compat`] - compat code, ported or planned for an upcoming release of ``burn``.
//!   * [`compat::activation_wrapper::Activation`] - activation layer abstraction wrapper.
//!   * [`compat::normalization_wrapper::Normalization`] - norm layer abstraction wrapper.
//! * [`errors`] - graph construction and input errors.
//! * [`layers`] - reusable neural network modules.
//!   * [`layers::blocks::cna`] - ``Conv2d + Norm + Activation`` block.
//!   * [`layers::pool::roi_pool`] - region of interest pooling.
//! * [`models`] - complete model families.
//!   * [`models::resnet`] - bottleneck units, stages, and the C4 backbone.
//!   * [`models::frcnn`] - region proposal head, classifier head, and the detector.

pub mod compat;
pub mod errors;
pub mod layers;
pub mod models;

#[cfg(test)]
#[allow(dead_code)]
pub(crate) mod testing;
