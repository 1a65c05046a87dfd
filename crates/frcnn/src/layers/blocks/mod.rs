//! Reusable composite blocks.
pub mod cna;
