//! # Faster R-CNN
//!
//! The two-stage detector graph: a shared [`crate::models::resnet::backbone`],
//! a region proposal head ([`rpn`]), and a region-batched classifier head
//! ([`classifier`]) fed by [`crate::layers::pool::roi_pool`].
//!
//! [`detector::FasterRcnnConfig`] assembles and validates the whole graph.

pub mod classifier;
pub mod detector;
pub mod rpn;
