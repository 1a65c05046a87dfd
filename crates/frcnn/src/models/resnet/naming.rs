//! # Layer Identity Tags
//!
//! Every learned layer in the detector has a stable name, used by
//! external checkpoint and weight-transfer tooling to key parameters.
//! Names are plain values carried by the modules; they never drive
//! control flow.
//!
//! Residual units are tagged by stage number and block letter:
//!
//! | layer | name |
//! |---|---|
//! | main path conv `n` | ``res{stage}{block}_branch2{a,b,c}`` |
//! | main path norm `n` | ``bn{stage}{block}_branch2{a,b,c}`` |
//! | shortcut conv | ``res{stage}{block}_branch1`` |
//! | shortcut norm | ``bn{stage}{block}_branch1`` |

use burn::module::Module;
use burn::prelude::Backend;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Main-path branch suffixes, in forward order.
pub const MAIN_BRANCHES: [&str; 3] = ["2a", "2b", "2c"];

/// Shortcut branch suffix.
pub const SHORTCUT_BRANCH: &str = "1";

/// Stage/block identity of a residual unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerTag {
    /// Stage number; the `ResNet` stages are numbered from 2.
    pub stage: usize,

    /// Block letter within the stage; ``'a'`` is the projection unit.
    pub block: char,
}

impl LayerTag {
    /// Create a tag.
    pub fn new(
        stage: usize,
        block: char,
    ) -> Self {
        Self { stage, block }
    }

    /// The tag of the `index`-th unit of a stage; ``0 -> 'a'``.
    ///
    /// # Panics
    ///
    /// If `index` is past ``'z'``.
    pub fn for_index(
        stage: usize,
        index: usize,
    ) -> Self {
        assert!(index < 26, "block index {index} has no letter");
        Self::new(stage, (b'a' + index as u8) as char)
    }

    /// Name of the convolution on `branch`.
    pub fn conv_name(
        &self,
        branch: &str,
    ) -> String {
        format!("res{}{}_branch{}", self.stage, self.block, branch)
    }

    /// Name of the normalization on `branch`.
    pub fn norm_name(
        &self,
        branch: &str,
    ) -> String {
        format!("bn{}{}_branch{}", self.stage, self.block, branch)
    }
}

impl fmt::Display for LayerTag {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}{}", self.stage, self.block)
    }
}

/// One named layer in the parameter registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSummary {
    /// The layer name.
    pub name: String,

    /// Number of learned scalars.
    pub num_params: usize,

    /// Whether the external optimizer may update the layer.
    pub trainable: bool,
}

impl LayerSummary {
    /// Summarize a module under a name.
    pub fn of<B: Backend, M: Module<B>>(
        name: impl Into<String>,
        module: &M,
        trainable: bool,
    ) -> Self {
        Self {
            name: name.into(),
            num_params: module.num_params(),
            trainable,
        }
    }
}

/// Mark a module's parameters as frozen unless `trainable`.
///
/// Frozen parameters do not require gradients, so an optimizer
/// stepping over the module's gradients leaves them untouched.
/// The forward pass is unaffected.
pub fn apply_trainable<B: Backend, M: Module<B>>(
    module: M,
    trainable: bool,
) -> M {
    if trainable { module } else { module.no_grad() }
}
