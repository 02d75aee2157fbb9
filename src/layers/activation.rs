//! Element-wise activation nodes

use crate::error::Result;
use crate::layers::{GraphOp, NodeScratch};
use crate::parameter_store::ParameterGradient;
use crate::tensor::ImageShape;
use crate::utils::{relu_inplace, sigmoid, sigmoid_derivative};

/// `max(0, x)`
pub struct ReluOp {
    shape: ImageShape,
}

impl ReluOp {
    pub fn new(shape: ImageShape) -> Self {
        Self { shape }
    }
}

impl GraphOp for ReluOp {
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
        _scratch: &mut NodeScratch,
    ) -> Result<()> {
        output.copy_from_slice(input);
        relu_inplace(output);
        Ok(())
    }

    fn backward(
        &self,
        input: &[f32],
        _output: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        _batch_size: usize,
        _scratch: &NodeScratch,
    ) -> Result<Option<ParameterGradient>> {
        for ((gi, &g), &x) in grad_input.iter_mut().zip(grad_output).zip(input) {
            *gi = if x > 0.0 { g } else { 0.0 };
        }
        Ok(None)
    }
}

/// `1 / (1 + e^-x)`
pub struct SigmoidOp {
    shape: ImageShape,
}

impl SigmoidOp {
    pub fn new(shape: ImageShape) -> Self {
        Self { shape }
    }
}

impl GraphOp for SigmoidOp {
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
        _scratch: &mut NodeScratch,
    ) -> Result<()> {
        for (y, &x) in output.iter_mut().zip(input) {
            *y = sigmoid(x);
        }
        Ok(())
    }

    // Derivative taken from the stored output.
    fn backward(
        &self,
        _input: &[f32],
        output: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        _batch_size: usize,
        _scratch: &NodeScratch,
    ) -> Result<Option<ParameterGradient>> {
        for ((gi, &g), &y) in grad_input.iter_mut().zip(grad_output).zip(output) {
            *gi = g * sigmoid_derivative(y);
        }
        Ok(None)
    }
}
