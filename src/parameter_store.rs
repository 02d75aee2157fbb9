//! Per-layer trainable parameters and Adam optimizer state
//!
//! A [`ParameterStore`] owns the weights and biases of one convolution-like
//! layer together with the momentum and velocity vectors that track them.
//! Stores are created once at compile time and shared between the training
//! and inference graphs through [`SharedParameterStore`].

use crate::error::{EngineError, Result};
use crate::optimizers::{Adam, AdamHyperparameters, Optimizer};
use crate::utils::SimpleRng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Store handle shared by every graph node that uses the same layer.
///
/// Forward passes take the read lock; the optimizer update holds the write
/// lock for its whole read-then-write sequence.
pub type SharedParameterStore = Arc<RwLock<ParameterStore>>;

/// Kernel geometry of a parametric layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelShape {
    pub width: usize,
    pub height: usize,
    pub in_channels: usize,
    pub out_channels: usize,
}

impl KernelShape {
    pub fn new(width: usize, height: usize, in_channels: usize, out_channels: usize) -> Self {
        Self {
            width,
            height,
            in_channels,
            out_channels,
        }
    }

    /// in_channels × height × width × out_channels
    pub fn weight_len(&self) -> usize {
        self.in_channels * self.height * self.width * self.out_channels
    }

    pub fn bias_len(&self) -> usize {
        self.out_channels
    }

    /// Glorot/Xavier uniform bound: sqrt(6 / (in_channels + out_channels)).
    pub fn glorot_limit(&self) -> f32 {
        (6.0f32 / (self.in_channels + self.out_channels) as f32).sqrt()
    }
}

/// Read-only view handed to forward kernels.
#[derive(Debug, Clone, Copy)]
pub struct ForwardParameters<'a> {
    pub weights: &'a [f32],
    pub biases: &'a [f32],
}

/// Gradient of the loss with respect to one store's weights and biases.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGradient {
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

impl ParameterGradient {
    pub fn zeros(shape: &KernelShape) -> Self {
        Self {
            weights: vec![0.0; shape.weight_len()],
            biases: vec![0.0; shape.bias_len()],
        }
    }
}

/// Persisted form of a store. Every vector is encoded as a length-prefixed
/// sequence of f32 values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: KernelShape,
    pub stride: usize,
    pub hyperparameters: AdamHyperparameters,
    pub time_step: u64,
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
    pub weight_momentum: Vec<f32>,
    pub weight_velocity: Vec<f32>,
    pub bias_momentum: Vec<f32>,
    pub bias_velocity: Vec<f32>,
}

impl ParameterState {
    fn validate(&self) -> Result<()> {
        let w = self.shape.weight_len();
        let b = self.shape.bias_len();
        let checks = [
            ("weights", self.weights.len(), w),
            ("weight momentum", self.weight_momentum.len(), w),
            ("weight velocity", self.weight_velocity.len(), w),
            ("biases", self.biases.len(), b),
            ("bias momentum", self.bias_momentum.len(), b),
            ("bias velocity", self.bias_velocity.len(), b),
        ];
        for (what, got, expected) in checks {
            if got != expected {
                return Err(EngineError::config(format!(
                    "{}: {} has {} values, kernel {:?} requires {}",
                    self.name, what, got, self.shape, expected
                )));
            }
        }
        Ok(())
    }
}

/// Weights, biases and Adam state for one layer.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    state: ParameterState,
    optimizer: Option<Adam>,
}

impl ParameterStore {
    /// Allocate and randomly initialize a store.
    ///
    /// Weights are drawn from U[-limit, limit] with
    /// `limit = sqrt(6 / (in_channels + out_channels))`; biases, momentum and
    /// velocity start at zero. The returned store has the Adam kernel attached.
    pub fn initialize(
        name: impl Into<String>,
        shape: KernelShape,
        stride: usize,
        hyperparameters: AdamHyperparameters,
        seed: u64,
    ) -> Result<Self> {
        let name = name.into();
        if shape.weight_len() == 0 {
            return Err(EngineError::config(format!(
                "{}: kernel {:?} has no weights",
                name, shape
            )));
        }
        if stride == 0 {
            return Err(EngineError::config(format!("{}: stride must be positive", name)));
        }

        let limit = shape.glorot_limit();
        let mut rng = SimpleRng::new(seed);
        let weights = (0..shape.weight_len())
            .map(|_| rng.gen_range_f32(-limit, limit))
            .collect();

        let w = shape.weight_len();
        let b = shape.bias_len();
        let store = Self {
            state: ParameterState {
                name,
                shape,
                stride,
                hyperparameters,
                time_step: 0,
                weights,
                biases: vec![0.0; b],
                weight_momentum: vec![0.0; w],
                weight_velocity: vec![0.0; w],
                bias_momentum: vec![0.0; b],
                bias_velocity: vec![0.0; b],
            },
            optimizer: Some(Adam::new(hyperparameters)),
        };
        store.log_summary();
        Ok(store)
    }

    /// Wrap the store for sharing between graphs.
    pub fn into_shared(self) -> SharedParameterStore {
        Arc::new(RwLock::new(self))
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn shape(&self) -> KernelShape {
        self.state.shape
    }

    pub fn stride(&self) -> usize {
        self.state.stride
    }

    pub fn hyperparameters(&self) -> AdamHyperparameters {
        self.state.hyperparameters
    }

    pub fn time_step(&self) -> u64 {
        self.state.time_step
    }

    pub fn weights(&self) -> &[f32] {
        &self.state.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.state.biases
    }

    pub fn weight_momentum(&self) -> &[f32] {
        &self.state.weight_momentum
    }

    pub fn weight_velocity(&self) -> &[f32] {
        &self.state.weight_velocity
    }

    pub fn bias_momentum(&self) -> &[f32] {
        &self.state.bias_momentum
    }

    pub fn bias_velocity(&self) -> &[f32] {
        &self.state.bias_velocity
    }

    pub fn parameter_count(&self) -> usize {
        self.state.weights.len() + self.state.biases.len()
    }

    /// Weights and biases for a forward kernel.
    pub fn forward_parameters(&self) -> ForwardParameters<'_> {
        ForwardParameters {
            weights: &self.state.weights,
            biases: &self.state.biases,
        }
    }

    /// One Adam step over weights and biases.
    ///
    /// Not idempotent: every call advances `time_step`, so the caller must
    /// apply each logical step exactly once.
    pub fn apply_gradient(&mut self, gradient: &ParameterGradient) -> Result<()> {
        let optimizer = self.optimizer.ok_or_else(|| {
            EngineError::config(format!(
                "{}: no optimizer attached to a restored store",
                self.state.name
            ))
        })?;
        if gradient.weights.len() != self.state.weights.len()
            || gradient.biases.len() != self.state.biases.len()
        {
            return Err(EngineError::config(format!(
                "{}: gradient shape ({} weights, {} biases) does not match store ({}, {})",
                self.state.name,
                gradient.weights.len(),
                gradient.biases.len(),
                self.state.weights.len(),
                self.state.biases.len()
            )));
        }

        let state = &mut self.state;
        state.time_step += 1;
        optimizer.step(
            &mut state.weights,
            &gradient.weights,
            &mut state.weight_momentum,
            &mut state.weight_velocity,
            state.time_step,
        );
        optimizer.step(
            &mut state.biases,
            &gradient.biases,
            &mut state.bias_momentum,
            &mut state.bias_velocity,
            state.time_step,
        );
        Ok(())
    }

    pub fn state(&self) -> &ParameterState {
        &self.state
    }

    /// Serialize all six vectors, hyperparameters and the time step.
    pub fn export_state(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.state)?)
    }

    /// Rebuild a store from [`export_state`](Self::export_state) output.
    ///
    /// The restored store is usable for inference immediately; it has no
    /// optimizer binding until [`attach_optimizer`](Self::attach_optimizer).
    pub fn restore_state(bytes: &[u8]) -> Result<Self> {
        let state: ParameterState = bincode::deserialize(bytes)?;
        Self::from_state(state)
    }

    pub fn from_state(state: ParameterState) -> Result<Self> {
        state.validate()?;
        Ok(Self {
            state,
            optimizer: None,
        })
    }

    /// Replace the numeric state in place, keeping the current optimizer binding.
    pub fn load_state(&mut self, state: ParameterState) -> Result<()> {
        state.validate()?;
        if state.shape != self.state.shape {
            return Err(EngineError::config(format!(
                "{}: saved kernel {:?} does not match {:?}",
                self.state.name, state.shape, self.state.shape
            )));
        }
        if self.optimizer.is_some() {
            self.optimizer = Some(Adam::new(state.hyperparameters));
        }
        self.state = state;
        Ok(())
    }

    pub fn attach_optimizer(&mut self) {
        self.optimizer = Some(Adam::new(self.state.hyperparameters));
    }

    pub fn is_optimizer_attached(&self) -> bool {
        self.optimizer.is_some()
    }

    fn log_summary(&self) {
        let tail_start = self.state.weights.len().saturating_sub(10);
        log::debug!(
            "{}: {} weights, last: {:?}",
            self.state.name,
            self.state.weights.len(),
            &self.state.weights[tail_start..]
        );
    }
}

/// Acquire a store for reading, mapping lock poisoning to an execution error.
pub(crate) fn read_store(store: &SharedParameterStore) -> Result<RwLockReadGuard<'_, ParameterStore>> {
    store
        .read()
        .map_err(|_| EngineError::DeviceExecution("parameter store lock poisoned".into()))
}

/// Acquire a store for the optimizer update.
pub(crate) fn write_store(
    store: &SharedParameterStore,
) -> Result<RwLockWriteGuard<'_, ParameterStore>> {
    store
        .write()
        .map_err(|_| EngineError::DeviceExecution("parameter store lock poisoned".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv_store(seed: u64) -> ParameterStore {
        ParameterStore::initialize(
            "Conv1",
            KernelShape::new(3, 3, 1, 8),
            1,
            AdamHyperparameters::default(),
            seed,
        )
        .unwrap()
    }

    #[test]
    fn test_vector_lengths_follow_shape() {
        let store = conv_store(42);
        assert_eq!(store.weights().len(), 72);
        assert_eq!(store.biases().len(), 8);
        assert_eq!(store.weight_momentum().len(), 72);
        assert_eq!(store.weight_velocity().len(), 72);
        assert_eq!(store.bias_momentum().len(), 8);
        assert_eq!(store.bias_velocity().len(), 8);
        assert_eq!(store.parameter_count(), 80);
    }

    #[test]
    fn test_glorot_bounds_use_channel_counts() {
        let store = conv_store(42);
        let limit = (6.0f32 / 9.0).sqrt();
        for &w in store.weights() {
            assert!(w >= -limit && w <= limit, "weight {} outside ±{}", w, limit);
        }
        assert!(store.biases().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_same_seed_same_weights() {
        assert_eq!(conv_store(9).weights(), conv_store(9).weights());
        assert_ne!(conv_store(9).weights(), conv_store(10).weights());
    }

    #[test]
    fn test_zero_kernel_rejected() {
        let err = ParameterStore::initialize(
            "Dense1",
            KernelShape::new(1, 1, 0, 4),
            1,
            AdamHyperparameters::default(),
            1,
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_apply_gradient_advances_time_step() {
        let mut store = conv_store(1);
        let before = store.weights().to_vec();
        let mut gradient = ParameterGradient::zeros(&store.shape());
        gradient.weights[0] = 1.0;
        gradient.biases[0] = -1.0;

        store.apply_gradient(&gradient).unwrap();

        assert_eq!(store.time_step(), 1);
        assert!(store.weights()[0] < before[0]);
        assert_eq!(store.weights()[1], before[1]);
        assert!(store.biases()[0] > 0.0);
    }

    #[test]
    fn test_mismatched_gradient_leaves_store_untouched() {
        let mut store = conv_store(1);
        let before = store.state().clone();
        let gradient = ParameterGradient {
            weights: vec![0.1; 71],
            biases: vec![0.1; 8],
        };

        let err = store.apply_gradient(&gradient).unwrap_err();

        assert!(matches!(err, EngineError::Configuration(_)));
        assert_eq!(store.state(), &before);
    }

    #[test]
    fn test_restored_store_is_detached() {
        let store = conv_store(3);
        let bytes = store.export_state().unwrap();
        let mut restored = ParameterStore::restore_state(&bytes).unwrap();

        assert!(!restored.is_optimizer_attached());
        let gradient = ParameterGradient::zeros(&restored.shape());
        assert!(restored.apply_gradient(&gradient).is_err());

        restored.attach_optimizer();
        restored.apply_gradient(&gradient).unwrap();
        assert_eq!(restored.time_step(), 1);
    }

    #[test]
    fn test_restore_rejects_inconsistent_vectors() {
        let mut state = conv_store(3).state().clone();
        state.bias_velocity.pop();
        let bytes = bincode::serialize(&state).unwrap();
        assert!(ParameterStore::restore_state(&bytes).is_err());
    }
}
