//! # Activation Layer Wrapper
//!
//! The detector graph needs a rectifier after most convolutions, a sigmoid
//! on the proposal objectness head, and room for experimentation elsewhere.
use burn::nn::{Gelu, LeakyRelu, LeakyReluConfig, Relu, Sigmoid, Tanh};
use burn::prelude::{Backend, Config, Module, Tensor};

/// [`Activation`] Configuration.
#[derive(Config, Debug)]
#[non_exhaustive]
pub enum ActivationConfig {
    /// [`Relu`] activation layer.
    Relu,

    /// [`Sigmoid`] activation layer.
    Sigmoid,

    /// [`Tanh`] activation layer.
    Tanh,

    /// [`Gelu`] activation layer.
    Gelu,

    /// [`LeakyRelu`] activation layer.
    LeakyRelu(LeakyReluConfig),
}

impl From<LeakyReluConfig> for ActivationConfig {
    fn from(config: LeakyReluConfig) -> Self {
        Self::LeakyRelu(config)
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self::Relu
    }
}

impl ActivationConfig {
    /// Initialize a wrapped activation layer.
    ///
    /// None of the supported activations carry parameters,
    /// so no device is needed.
    pub fn init(&self) -> Activation {
        match self {
            ActivationConfig::Relu => Activation::Relu(Relu),
            ActivationConfig::Sigmoid => Activation::Sigmoid(Sigmoid),
            ActivationConfig::Tanh => Activation::Tanh(Tanh),
            ActivationConfig::Gelu => Activation::Gelu(Gelu),
            ActivationConfig::LeakyRelu(conf) => Activation::LeakyRelu(conf.init()),
        }
    }
}

/// Activation Layer Wrapper.
///
/// Stateless; implements [`Module`] for every backend.
#[derive(Module, Clone, Debug)]
#[non_exhaustive]
pub enum Activation {
    /// [`Relu`] activation layer.
    Relu(Relu),

    /// [`Sigmoid`] activation layer.
    Sigmoid(Sigmoid),

    /// [`Tanh`] activation layer.
    Tanh(Tanh),

    /// [`Gelu`] activation layer.
    Gelu(Gelu),

    /// [`LeakyRelu`] activation layer.
    LeakyRelu(LeakyRelu),
}

impl Activation {
    /// Forward pass; shape preserving.
    pub fn forward<B: Backend, const D: usize>(
        &self,
        input: Tensor<B, D>,
    ) -> Tensor<B, D> {
        match self {
            Activation::Relu(layer) => layer.forward(input),
            Activation::Sigmoid(layer) => layer.forward(input),
            Activation::Tanh(layer) => layer.forward(input),
            Activation::Gelu(layer) => layer.forward(input),
            Activation::LeakyRelu(layer) => layer.forward(input),
        }
    }

    /// Build a [`ActivationConfig`] for this module.
    pub fn to_config(&self) -> ActivationConfig {
        match self {
            Activation::Relu(_) => ActivationConfig::Relu,
            Activation::Sigmoid(_) => ActivationConfig::Sigmoid,
            Activation::Tanh(_) => ActivationConfig::Tanh,
            Activation::Gelu(_) => ActivationConfig::Gelu,
            Activation::LeakyRelu(layer) => LeakyReluConfig::new()
                .with_negative_slope(layer.negative_slope)
                .into(),
        }
    }
}
