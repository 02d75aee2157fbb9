//! Adam (Adaptive Moment Estimation) update kernel
//!
//! The update rule is:
//!
//! ```text
//! m_t = β1 * m_{t-1} + (1 - β1) * gradient
//! v_t = β2 * v_{t-1} + (1 - β2) * gradient²
//! m_hat = m_t / (1 - β1^t)
//! v_hat = v_t / (1 - β2^t)
//! parameter = parameter - α * m_hat / (√v_hat + ε)
//! ```
//!
//! Kingma, D. P., & Ba, J. (2014). Adam: A method for stochastic optimization.
//! arXiv preprint arXiv:1412.6980.

use crate::optimizers::Optimizer;
use serde::{Deserialize, Serialize};

/// Adam hyperparameters, persisted alongside every parameter store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamHyperparameters {
    /// Step size (α)
    pub learning_rate: f32,
    /// Decay rate for the first moment (typically 0.9)
    pub beta1: f32,
    /// Decay rate for the second moment (typically 0.999)
    pub beta2: f32,
    /// Numerical stability constant (typically 1e-8)
    pub epsilon: f32,
}

impl Default for AdamHyperparameters {
    /// On-device defaults: a deliberately small learning rate of 5e-5.
    fn default() -> Self {
        Self {
            learning_rate: 5e-5,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Stateless Adam kernel.
#[derive(Debug, Clone, Copy)]
pub struct Adam {
    hyper: AdamHyperparameters,
}

impl Adam {
    pub fn new(hyper: AdamHyperparameters) -> Self {
        Self { hyper }
    }
}

impl Optimizer for Adam {
    fn step(
        &self,
        parameters: &mut [f32],
        gradients: &[f32],
        momentum: &mut [f32],
        velocity: &mut [f32],
        time_step: u64,
    ) {
        assert_eq!(
            parameters.len(),
            gradients.len(),
            "Parameters and gradients must have the same length"
        );
        assert_eq!(parameters.len(), momentum.len());
        assert_eq!(parameters.len(), velocity.len());

        let AdamHyperparameters {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.hyper;
        let t = time_step.min(i32::MAX as u64) as i32;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);

        for i in 0..parameters.len() {
            let g = gradients[i];
            momentum[i] = beta1 * momentum[i] + (1.0 - beta1) * g;
            velocity[i] = beta2 * velocity[i] + (1.0 - beta2) * g * g;

            let m_hat = momentum[i] / bias_correction1;
            let v_hat = velocity[i] / bias_correction2;

            parameters[i] -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
        }
    }
}
