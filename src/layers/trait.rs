//! Graph operation trait
//!
//! Every non-terminal graph node wraps a [`GraphOp`]. Ops are shared by all
//! command units in flight, so they keep no per-run state themselves: anything
//! a backward pass needs from its forward pass (e.g. a dropout mask) lives in
//! the [`NodeScratch`] owned by the run.

use crate::error::Result;
use crate::parameter_store::{ParameterGradient, SharedParameterStore};
use crate::tensor::ImageShape;
use crate::utils::SimpleRng;

/// Per-run, per-node working state.
#[derive(Debug, Clone)]
pub struct NodeScratch {
    pub rng: SimpleRng,
    pub mask: Vec<f32>,
}

impl NodeScratch {
    pub fn new(rng: SimpleRng) -> Self {
        Self {
            rng,
            mask: Vec::new(),
        }
    }
}

/// Core trait for graph operations.
///
/// Buffers are flattened batches: `batch_size × input_shape().element_count()`
/// values for inputs and `batch_size × output_shape().element_count()` values
/// for outputs, each image stored channel-major.
///
/// # Example
///
/// ```ignore
/// let mut output = vec![0.0f32; batch_size * op.output_shape().element_count()];
/// op.forward(&input, &mut output, batch_size, &mut scratch)?;
///
/// let mut grad_input = vec![0.0f32; input.len()];
/// let gradient = op.backward(&input, &output, &grad_output, &mut grad_input, batch_size, &scratch)?;
/// ```
pub trait GraphOp: Send + Sync {
    /// Feature map shape consumed per sample.
    fn input_shape(&self) -> ImageShape;

    /// Feature map shape produced per sample.
    fn output_shape(&self) -> ImageShape;

    /// Forward propagation.
    fn forward(
        &self,
        input: &[f32],
        output: &mut [f32],
        batch_size: usize,
        scratch: &mut NodeScratch,
    ) -> Result<()>;

    /// Backward propagation.
    ///
    /// Overwrites `grad_input` with the gradient with respect to `input` and
    /// returns the parameter gradient for parametric ops. `output` is the
    /// value this op produced for `input` in the same run.
    fn backward(
        &self,
        input: &[f32],
        output: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
        scratch: &NodeScratch,
    ) -> Result<Option<ParameterGradient>>;

    /// The store updated from this op's gradient, if it has trainable state.
    fn parameter_store(&self) -> Option<&SharedParameterStore> {
        None
    }
}
