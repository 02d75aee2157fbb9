//! Dropout node for regularization
//!
//! In a training graph each unit is kept with probability `keep_probability`
//! and scaled by `1 / keep_probability`, so expected activations match the
//! inference graph, where the node is the identity.

use crate::error::{EngineError, Result};
use crate::layers::{GraphOp, NodeScratch};
use crate::parameter_store::ParameterGradient;
use crate::tensor::ImageShape;

/// Dropout over a feature map of any shape.
///
/// The mask drawn in `forward` is written to the run's [`NodeScratch`] and
/// read back by `backward`, so one op can serve several command units at once.
///
/// # Example
///
/// ```
/// use sequential_trainer::layers::{DropoutOp, GraphOp, NodeScratch};
/// use sequential_trainer::tensor::ImageShape;
/// use sequential_trainer::utils::SimpleRng;
///
/// let op = DropoutOp::new(0.5, false, ImageShape::vector(4)).unwrap();
/// let mut output = vec![0.0f32; 4];
/// let mut scratch = NodeScratch::new(SimpleRng::new(7));
/// op.forward(&[1.0, 2.0, 3.0, 4.0], &mut output, 1, &mut scratch).unwrap();
/// assert_eq!(output, vec![1.0, 2.0, 3.0, 4.0]);
/// ```
pub struct DropoutOp {
    keep_probability: f32,
    training: bool,
    shape: ImageShape,
}

impl DropoutOp {
    /// Creates a dropout op.
    ///
    /// # Arguments
    ///
    /// * `keep_probability` - Probability of keeping each unit, in (0, 1]
    /// * `training` - `false` builds the inference-graph identity
    /// * `shape` - Feature map shape (unchanged by dropout)
    pub fn new(keep_probability: f32, training: bool, shape: ImageShape) -> Result<Self> {
        if !(keep_probability > 0.0 && keep_probability <= 1.0) {
            return Err(EngineError::config(format!(
                "keep probability {} outside (0, 1]",
                keep_probability
            )));
        }
        Ok(Self {
            keep_probability,
            training,
            shape,
        })
    }

    pub fn keep_probability(&self) -> f32 {
        self.keep_probability
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl GraphOp for DropoutOp {
    fn input_shape(&self) -> ImageShape {
        self.shape
    }

    fn output_shape(&self) -> ImageShape {
        self.shape
    }

    fn forward(
        &self,
        input: &[f32],
        output: &mut [f32],
        _batch_size: usize,
        scratch: &mut NodeScratch,
    ) -> Result<()> {
        if !self.training {
            output.copy_from_slice(input);
            return Ok(());
        }

        let scale = 1.0 / self.keep_probability;
        let NodeScratch { rng, mask } = scratch;
        mask.clear();
        mask.extend((0..input.len()).map(|_| {
            if rng.next_f32() < self.keep_probability {
                scale
            } else {
                0.0
            }
        }));
        for ((y, &x), &m) in output.iter_mut().zip(input).zip(mask.iter()) {
            *y = x * m;
        }
        Ok(())
    }

    fn backward(
        &self,
        _input: &[f32],
        _output: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        _batch_size: usize,
        scratch: &NodeScratch,
    ) -> Result<Option<ParameterGradient>> {
        if !self.training {
            grad_input.copy_from_slice(grad_output);
            return Ok(None);
        }
        if scratch.mask.len() != grad_output.len() {
            return Err(EngineError::GraphEncoding(
                "dropout backward ran without a matching forward mask".into(),
            ));
        }
        for ((gi, &g), &m) in grad_input.iter_mut().zip(grad_output).zip(&scratch.mask) {
            *gi = g * m;
        }
        Ok(None)
    }
}
