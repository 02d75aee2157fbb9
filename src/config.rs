//! Configuration structures for training
//!
//! This module provides the run configuration: Adam hyperparameters, the
//! iteration schedule, the backend size and the in-flight bound.

use crate::error::{EngineError, Result};
use crate::optimizers::AdamHyperparameters;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration for a training run.
///
/// Every field has a default, so a config file only needs the values it
/// changes.
///
/// # Example
///
/// ```json
/// {
///   "learning_rate": 0.001,
///   "iterations": 500,
///   "batch_size": 32,
///   "max_in_flight": 2
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Adam step size
    pub learning_rate: f32,

    /// Exponential decay rate of the first-moment estimate
    pub beta1: f32,

    /// Exponential decay rate of the second-moment estimate
    pub beta2: f32,

    /// Denominator term guarding against division by zero
    pub epsilon: f32,

    /// Training iterations (minibatches) per epoch
    pub iterations: usize,

    pub epochs: usize,

    pub batch_size: usize,

    /// Command units allowed in flight at once
    pub max_in_flight: usize,

    /// Worker threads of the compute backend
    pub backend_workers: usize,

    /// Length of the one-hot targets and of the network output
    pub class_count: usize,

    /// Seed for weight initialization, sampling and dropout
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let adam = AdamHyperparameters::default();
        Self {
            learning_rate: adam.learning_rate,
            beta1: adam.beta1,
            beta2: adam.beta2,
            epsilon: adam.epsilon,
            iterations: 300,
            epochs: 1,
            batch_size: 40,
            max_in_flight: 2,
            backend_workers: 2,
            class_count: 10,
            seed: 0,
        }
    }
}

impl TrainingConfig {
    pub fn hyperparameters(&self) -> AdamHyperparameters {
        AdamHyperparameters {
            learning_rate: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(EngineError::config("learning_rate must be positive"));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(EngineError::config(format!(
                    "{} must be in [0, 1), got {}",
                    name, beta
                )));
            }
        }
        if !(self.epsilon > 0.0) {
            return Err(EngineError::config("epsilon must be positive"));
        }

        let counts = [
            ("iterations", self.iterations),
            ("epochs", self.epochs),
            ("batch_size", self.batch_size),
            ("max_in_flight", self.max_in_flight),
            ("backend_workers", self.backend_workers),
            ("class_count", self.class_count),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(EngineError::config(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Loads a training configuration from a JSON file.
///
/// Reads the file at `path`, deserializes it into a `TrainingConfig` (missing
/// fields take their defaults) and validates the result.
///
/// # Examples
///
/// ```no_run
/// use sequential_trainer::config::load_config;
///
/// let cfg = load_config("config/mnist_sequential.json").unwrap();
/// assert!(cfg.batch_size > 0);
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path)?;
    let config: TrainingConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.learning_rate, 5e-5);
        assert_eq!(config.iterations, 300);
        assert_eq!(config.batch_size, 40);
        assert_eq!(config.max_in_flight, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TrainingConfig = serde_json::from_str(r#"{"iterations": 5}"#).unwrap();
        assert_eq!(config.iterations, 5);
        assert_eq!(config.class_count, 10);
    }

    #[test]
    fn test_invalid_beta_rejected() {
        let config = TrainingConfig {
            beta2: 1.0,
            ..TrainingConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
