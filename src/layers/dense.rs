//! Dense (fully connected) node
//!
//! Performs `y = W x + b` on a 1×1×in feature vector. Weights are stored
//! row-major as `[out_channels][in_channels]`, which is the convolution layout
//! with a 1×1 kernel.

use crate::error::{EngineError, Result};
use crate::layers::{GraphOp, NodeScratch};
use crate::parameter_store::{read_store, KernelShape, ParameterGradient, SharedParameterStore};
use crate::tensor::ImageShape;

/// Fully connected layer backed by a `(1, 1, in, out)` parameter store.
///
/// # Example
///
/// ```ignore
/// let kernel = KernelShape::new(1, 1, 1568, 10);
/// let op = FullyConnectedOp::new(store, kernel, ImageShape::vector(1568))?;
/// assert_eq!(op.output_shape(), ImageShape::vector(10));
/// ```
pub struct FullyConnectedOp {
    store: SharedParameterStore,
    kernel: KernelShape,
}

impl FullyConnectedOp {
    pub fn new(store: SharedParameterStore, kernel: KernelShape, input: ImageShape) -> Result<Self> {
        if !input.is_vector() {
            return Err(EngineError::config(format!(
                "dense layer needs a 1x1 feature vector, upstream produces {} (add a Flatten)",
                input
            )));
        }
        if input.channels != kernel.in_channels {
            return Err(EngineError::config(format!(
                "dense layer expects {} inputs, upstream produces {}",
                kernel.in_channels, input.channels
            )));
        }
        Ok(Self { store, kernel })
    }

    pub fn input_size(&self) -> usize {
        self.kernel.in_channels
    }

    pub fn output_size(&self) -> usize {
        self.kernel.out_channels
    }
}

impl GraphOp for FullyConnectedOp {
    fn input_shape(&self) -> ImageShape {
        ImageShape::vector(self.kernel.in_channels)
    }

    fn output_shape(&self) -> ImageShape {
        ImageShape::vector(self.kernel.out_channels)
    }

    fn forward(
        &self,
        input: &[f32],
        output: &mut [f32],
        batch_size: usize,
        _scratch: &mut NodeScratch,
    ) -> Result<()> {
        let store = read_store(&self.store)?;
        let params = store.forward_parameters();
        let n_in = self.kernel.in_channels;
        let n_out = self.kernel.out_channels;

        for b in 0..batch_size {
            let x = &input[b * n_in..(b + 1) * n_in];
            let y = &mut output[b * n_out..(b + 1) * n_out];
            for (o, value) in y.iter_mut().enumerate() {
                let row = &params.weights[o * n_in..(o + 1) * n_in];
                *value = params.biases[o] + row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>();
            }
        }
        Ok(())
    }

    fn backward(
        &self,
        input: &[f32],
        _output: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
        _scratch: &NodeScratch,
    ) -> Result<Option<ParameterGradient>> {
        let store = read_store(&self.store)?;
        let weights = store.weights();
        let n_in = self.kernel.in_channels;
        let n_out = self.kernel.out_channels;
        let mut gradient = ParameterGradient::zeros(&self.kernel);

        grad_input.iter_mut().for_each(|v| *v = 0.0);

        for b in 0..batch_size {
            let x = &input[b * n_in..(b + 1) * n_in];
            let g_out = &grad_output[b * n_out..(b + 1) * n_out];
            let g_in = &mut grad_input[b * n_in..(b + 1) * n_in];

            for (o, &g) in g_out.iter().enumerate() {
                gradient.biases[o] += g;
                let row = o * n_in;
                for i in 0..n_in {
                    gradient.weights[row + i] += g * x[i];
                    g_in[i] += g * weights[row + i];
                }
            }
        }
        Ok(Some(gradient))
    }

    fn parameter_store(&self) -> Option<&SharedParameterStore> {
        Some(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizers::AdamHyperparameters;
    use crate::parameter_store::ParameterStore;
    use crate::utils::SimpleRng;

    fn dense(weights: Vec<f32>, biases: Vec<f32>, n_in: usize, n_out: usize) -> FullyConnectedOp {
        let kernel = KernelShape::new(1, 1, n_in, n_out);
        let mut store =
            ParameterStore::initialize("Dense1", kernel, 1, AdamHyperparameters::default(), 42)
                .unwrap();
        let mut state = store.state().clone();
        state.weights = weights;
        state.biases = biases;
        store.load_state(state).unwrap();
        FullyConnectedOp::new(store.into_shared(), kernel, ImageShape::vector(n_in)).unwrap()
    }

    #[test]
    fn test_dense_forward() {
        // W = [[1, 2], [3, 4], [5, 6]], b = [0.5, -0.5, 0]
        let op = dense(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![0.5, -0.5, 0.0], 2, 3);
        let input = vec![1.0, 1.0, 0.0, 2.0];
        let mut output = vec![0.0; 6];
        op.forward(&input, &mut output, 2, &mut NodeScratch::new(SimpleRng::new(1)))
            .unwrap();

        assert_eq!(output, vec![3.5, 6.5, 11.0, 4.5, 7.5, 12.0]);
    }

    #[test]
    fn test_dense_backward() {
        let op = dense(vec![1.0, 2.0, 3.0, 4.0], vec![0.0, 0.0], 2, 2);
        let input = vec![1.0, -1.0];
        let grad_output = vec![1.0, 0.5];
        let mut grad_input = vec![0.0; 2];
        let gradient = op
            .backward(
                &input,
                &[0.0, 0.0],
                &grad_output,
                &mut grad_input,
                1,
                &NodeScratch::new(SimpleRng::new(1)),
            )
            .unwrap()
            .unwrap();

        assert_eq!(gradient.biases, vec![1.0, 0.5]);
        assert_eq!(gradient.weights, vec![1.0, -1.0, 0.5, -0.5]);
        assert_eq!(grad_input, vec![2.5, 4.0]);
    }

    #[test]
    fn test_spatial_input_rejected() {
        let kernel = KernelShape::new(1, 1, 16, 3);
        let store =
            ParameterStore::initialize("Dense1", kernel, 1, AdamHyperparameters::default(), 1)
                .unwrap()
                .into_shared();
        let result = FullyConnectedOp::new(store, kernel, ImageShape::new(4, 4, 1));
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
