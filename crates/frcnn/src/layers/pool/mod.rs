//! Pooling layers.
pub mod roi_pool;
