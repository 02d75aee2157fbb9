//! Tests for parameter stores
//!
//! This file tests:
//! - Glorot initialization bounds and zeroed optimizer state
//! - The Adam update rule against hand-computed values
//! - Export/restore round trips and model-level parameter import

use approx::assert_relative_eq;
use sequential_trainer::optimizers::AdamHyperparameters;
use sequential_trainer::parameter_store::{KernelShape, ParameterGradient, ParameterStore};

fn hyper(learning_rate: f32) -> AdamHyperparameters {
    AdamHyperparameters {
        learning_rate,
        ..AdamHyperparameters::default()
    }
}

// ============================================================================
// Initialization Tests
// ============================================================================

mod initialization_tests {
    use super::*;

    #[test]
    fn test_glorot_bound_for_dense_shape() {
        let shape = KernelShape::new(1, 1, 100, 50);
        let store = ParameterStore::initialize("Dense1", shape, 1, hyper(5e-5), 42).unwrap();
        let limit = (6.0f32 / 150.0).sqrt();

        assert_eq!(store.weights().len(), 5000);
        assert!(store
            .weights()
            .iter()
            .all(|&w| w >= -limit && w <= limit));
        // Not degenerate.
        assert!(store.weights().iter().any(|&w| w.abs() > limit / 2.0));
    }

    #[test]
    fn test_state_vectors_start_at_zero() {
        let shape = KernelShape::new(3, 3, 4, 8);
        let store = ParameterStore::initialize("Conv2", shape, 1, hyper(5e-5), 1).unwrap();

        assert_eq!(store.time_step(), 0);
        assert_eq!(store.name(), "Conv2");
        assert!(store.biases().iter().all(|&v| v == 0.0));
        assert!(store.weight_momentum().iter().all(|&v| v == 0.0));
        assert!(store.weight_velocity().iter().all(|&v| v == 0.0));
        assert!(store.bias_momentum().iter().all(|&v| v == 0.0));
        assert!(store.bias_velocity().iter().all(|&v| v == 0.0));
        assert_eq!(store.weight_momentum().len(), 3 * 3 * 4 * 8);
        assert_eq!(store.bias_velocity().len(), 8);
    }

    #[test]
    fn test_zero_stride_rejected() {
        let shape = KernelShape::new(3, 3, 1, 1);
        assert!(ParameterStore::initialize("Conv1", shape, 0, hyper(5e-5), 1).is_err());
    }
}

// ============================================================================
// Adam Update Tests
// ============================================================================

mod adam_tests {
    use super::*;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let shape = KernelShape::new(1, 1, 1, 1);
        let mut store = ParameterStore::initialize("Dense1", shape, 1, hyper(0.1), 3).unwrap();
        let w0 = store.weights()[0];

        store
            .apply_gradient(&ParameterGradient {
                weights: vec![0.5],
                biases: vec![-2.0],
            })
            .unwrap();

        // With bias correction, the first step is lr * g / (|g| + eps).
        assert_relative_eq!(store.weights()[0], w0 - 0.1, epsilon = 1e-6);
        assert_relative_eq!(store.biases()[0], 0.1, epsilon = 1e-6);
        assert_relative_eq!(store.weight_momentum()[0], 0.05, max_relative = 1e-4);
        assert_relative_eq!(store.weight_velocity()[0], 0.00025, max_relative = 1e-3);
        assert_eq!(store.time_step(), 1);
    }

    #[test]
    fn test_second_step_matches_formula() {
        let shape = KernelShape::new(1, 1, 1, 1);
        let mut store = ParameterStore::initialize("Dense1", shape, 1, hyper(0.01), 5).unwrap();
        let w0 = store.weights()[0];
        let gradient = ParameterGradient {
            weights: vec![1.0],
            biases: vec![0.0],
        };
        store.apply_gradient(&gradient).unwrap();
        store.apply_gradient(&gradient).unwrap();

        let (b1, b2, eps) = (0.9f32, 0.999f32, 1e-8f32);
        let m = (1.0 - b1) * 1.0 * b1 + (1.0 - b1) * 1.0;
        let v = (1.0 - b2) * 1.0 * b2 + (1.0 - b2) * 1.0;
        let m_hat = m / (1.0 - b1 * b1);
        let v_hat = v / (1.0 - b2 * b2);
        let expected = w0 - 0.01 - 0.01 * m_hat / (v_hat.sqrt() + eps);

        assert_relative_eq!(store.weights()[0], expected, epsilon = 1e-5);
        assert_eq!(store.time_step(), 2);
        assert_eq!(store.biases()[0], 0.0);
    }

    #[test]
    fn test_identical_stores_stay_identical() {
        let shape = KernelShape::new(3, 3, 1, 2);
        let mut a = ParameterStore::initialize("Conv1", shape, 1, hyper(1e-3), 11).unwrap();
        let mut b = ParameterStore::initialize("Conv1", shape, 1, hyper(1e-3), 11).unwrap();
        let mut gradient = ParameterGradient::zeros(&shape);
        gradient.weights.iter_mut().enumerate().for_each(|(i, g)| *g = i as f32 * 0.1 - 0.5);
        gradient.biases = vec![0.3, -0.3];

        for _ in 0..5 {
            a.apply_gradient(&gradient).unwrap();
            b.apply_gradient(&gradient).unwrap();
        }
        assert_eq!(a.state(), b.state());
    }
}

// ============================================================================
// Persistence Tests
// ============================================================================

mod persistence_tests {
    use super::*;

    #[test]
    fn test_export_restore_round_trip() {
        let shape = KernelShape::new(3, 3, 2, 4);
        let mut store = ParameterStore::initialize("Conv1", shape, 2, hyper(1e-3), 9).unwrap();
        let mut gradient = ParameterGradient::zeros(&shape);
        gradient.weights[5] = 1.0;
        gradient.biases[1] = -1.0;
        store.apply_gradient(&gradient).unwrap();

        let bytes = store.export_state().unwrap();
        let restored = ParameterStore::restore_state(&bytes).unwrap();

        assert_eq!(restored.state(), store.state());
        assert_eq!(restored.stride(), 2);
        assert_eq!(restored.time_step(), 1);
        assert!(!restored.is_optimizer_attached());
    }

    #[test]
    fn test_restored_store_continues_identically() {
        let shape = KernelShape::new(1, 1, 3, 2);
        let mut original = ParameterStore::initialize("Dense1", shape, 1, hyper(1e-2), 4).unwrap();
        let gradient = ParameterGradient {
            weights: vec![0.1, 0.2, 0.3, -0.1, -0.2, -0.3],
            biases: vec![1.0, -1.0],
        };
        original.apply_gradient(&gradient).unwrap();

        let mut restored = ParameterStore::restore_state(&original.export_state().unwrap()).unwrap();
        restored.attach_optimizer();
        original.apply_gradient(&gradient).unwrap();
        restored.apply_gradient(&gradient).unwrap();

        assert_eq!(restored.state(), original.state());
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        assert!(ParameterStore::restore_state(&[1, 2, 3]).is_err());
    }
}
