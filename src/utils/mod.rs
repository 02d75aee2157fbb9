//! Shared utilities: random number generation and activation helpers.

pub mod activations;
pub mod rng;

pub use activations::{argmax, relu_inplace, sigmoid, sigmoid_derivative, softmax_rows};
pub use rng::SimpleRng;
