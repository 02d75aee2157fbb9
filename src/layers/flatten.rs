//! Reshape a feature map into a 1×1×width vector
//!
//! Channel-major storage means flattening is a plain copy: the vector lists
//! channel 0 row by row, then channel 1, and so on.

use crate::error::{EngineError, Result};
use crate::layers::{GraphOp, NodeScratch};
use crate::parameter_store::ParameterGradient;
use crate::tensor::ImageShape;

pub struct FlattenOp {
    input: ImageShape,
    width: usize,
}

impl FlattenOp {
    pub fn new(width: usize, input: ImageShape) -> Result<Self> {
        if input.element_count() != width {
            return Err(EngineError::config(format!(
                "flatten width {} does not match upstream {} ({} elements)",
                width,
                input,
                input.element_count()
            )));
        }
        Ok(Self { input, width })
    }
}

impl GraphOp for FlattenOp {
    fn input_shape(&self) -> ImageShape {
        self.input
    }

    fn output_shape(&self) -> ImageShape {
        ImageShape::vector(self.width)
    }

    fn forward(
        &self,
        input: &[f32],
        output: &mut [f32],
        _batch_size: usize,
        _scratch: &mut NodeScratch,
    ) -> Result<()> {
        output.copy_from_slice(input);
        Ok(())
    }

    fn backward(
        &self,
        _input: &[f32],
        _output: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        _batch_size: usize,
        _scratch: &NodeScratch,
    ) -> Result<Option<ParameterGradient>> {
        grad_input.copy_from_slice(grad_output);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_shape() {
        let op = FlattenOp::new(8 * 14 * 14, ImageShape::new(14, 14, 8)).unwrap();
        assert_eq!(op.output_shape(), ImageShape::vector(1568));
    }

    #[test]
    fn test_flatten_width_mismatch() {
        assert!(FlattenOp::new(100, ImageShape::new(14, 14, 8)).is_err());
    }
}
