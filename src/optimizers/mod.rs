//! Optimizer abstractions for parameter updates
//!
//! Optimizers here are update kernels: they hold hyperparameters only. The
//! per-parameter state (momentum, velocity, time step) lives in the
//! [`ParameterStore`](crate::parameter_store::ParameterStore) that owns the
//! parameters, so that it can be saved and restored with them.
//!
//! # Example
//!
//! ```
//! use sequential_trainer::optimizers::{Adam, AdamHyperparameters, Optimizer};
//!
//! let adam = Adam::new(AdamHyperparameters::default());
//! let mut weights = vec![1.0, 2.0];
//! let mut m = vec![0.0; 2];
//! let mut v = vec![0.0; 2];
//! adam.step(&mut weights, &[0.5, -0.5], &mut m, &mut v, 1);
//! assert!(weights[0] < 1.0 && weights[1] > 2.0);
//! ```

pub mod adam;

pub use adam::{Adam, AdamHyperparameters};

use serde::{Deserialize, Serialize};

/// Optimizer selected when compiling a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
}

/// Core trait for update kernels.
pub trait Optimizer {
    /// Apply one update to `parameters` in place.
    ///
    /// `momentum` and `velocity` are the state vectors tracking `parameters`;
    /// `time_step` is the already-incremented step counter (starting at 1).
    ///
    /// # Panics
    ///
    /// Panics if the four slices differ in length. Callers validate shapes first.
    fn step(
        &self,
        parameters: &mut [f32],
        gradients: &[f32],
        momentum: &mut [f32],
        velocity: &mut [f32],
        time_step: u64,
    );
}
