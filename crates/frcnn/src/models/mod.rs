//! Complete model families.

pub mod frcnn;
pub mod resnet;
