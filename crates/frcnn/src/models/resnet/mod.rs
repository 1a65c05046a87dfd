//! # `ResNet`
//!
//! Bottleneck residual units, stages, and the C4 backbone used by the
//! detector. Every unit and stage can run on a single-image batch, or
//! region-batched through [`region_batched::RegionBatched`].

pub mod backbone;
pub mod naming;
pub mod region_batched;
pub mod shortcut;
pub mod stage;
pub mod stem;
pub mod unit;
pub mod util;
