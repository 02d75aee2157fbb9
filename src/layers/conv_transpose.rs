//! Transposed 2D convolution node (learned upsampling)
//!
//! Each input pixel scatters a weighted copy of the kernel into the output.
//! Weights share the convolution layout
//! `[out_channels][in_channels][kernel_height][kernel_width]`.

use crate::error::{EngineError, Result};
use crate::layers::{GraphOp, NodeScratch, Padding};
use crate::parameter_store::{read_store, KernelShape, ParameterGradient, SharedParameterStore};
use crate::tensor::ImageShape;

use super::conv2d::AxisGeometry;

/// Geometry of a transposed convolution along one axis.
///
/// `Same` upsamples by exactly `stride`; `Valid` produces the full
/// `(input - 1) * stride + kernel` extent.
pub(crate) fn transpose_axis(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Result<AxisGeometry> {
    if kernel == 0 || stride == 0 || input == 0 {
        return Err(EngineError::config(
            "transposed convolution needs positive input, kernel and stride",
        ));
    }
    let full = (input - 1) * stride + kernel;
    Ok(match padding {
        Padding::Same => {
            let out = input * stride;
            AxisGeometry {
                out,
                pad_before: full.saturating_sub(out) / 2,
            }
        }
        Padding::Valid => AxisGeometry {
            out: full,
            pad_before: 0,
        },
    })
}

pub struct ConvolutionTransposeOp {
    store: SharedParameterStore,
    kernel: KernelShape,
    stride: usize,
    input: ImageShape,
    output: ImageShape,
    pad_top: usize,
    pad_left: usize,
}

impl ConvolutionTransposeOp {
    pub fn new(
        store: SharedParameterStore,
        kernel: KernelShape,
        stride: usize,
        padding: Padding,
        input: ImageShape,
    ) -> Result<Self> {
        if input.channels != kernel.in_channels {
            return Err(EngineError::config(format!(
                "transposed convolution expects {} input channels, upstream produces {}",
                kernel.in_channels, input.channels
            )));
        }
        let rows = transpose_axis(input.height, kernel.height, stride, padding)?;
        let cols = transpose_axis(input.width, kernel.width, stride, padding)?;
        Ok(Self {
            store,
            kernel,
            stride,
            input,
            output: ImageShape::new(cols.out, rows.out, kernel.out_channels),
            pad_top: rows.pad_before,
            pad_left: cols.pad_before,
        })
    }

    /// Output pixel reached from input pixel (iy, ix) through tap (ky, kx).
    fn target(&self, iy: usize, ix: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
        let oy = (iy * self.stride + ky).checked_sub(self.pad_top)?;
        let ox = (ix * self.stride + kx).checked_sub(self.pad_left)?;
        (oy < self.output.height && ox < self.output.width).then_some((oy, ox))
    }

    fn weight_index(&self, oc: usize, ic: usize, ky: usize, kx: usize) -> usize {
        ((oc * self.kernel.in_channels + ic) * self.kernel.height + ky) * self.kernel.width + kx
    }
}

impl GraphOp for ConvolutionTransposeOp {
    fn input_shape(&self) -> ImageShape {
        self.input
    }

    fn output_shape(&self) -> ImageShape {
        self.output
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
        let in_size = self.input.element_count();
        let out_size = self.output.element_count();
        let in_spatial = self.input.spatial();
        let out_spatial = self.output.spatial();

        for b in 0..batch_size {
            let out_b = &mut output[b * out_size..(b + 1) * out_size];
            for (oc, plane) in out_b.chunks_exact_mut(out_spatial).enumerate() {
                plane.iter_mut().for_each(|v| *v = params.biases[oc]);
            }

            for ic in 0..self.kernel.in_channels {
                let in_base = b * in_size + ic * in_spatial;
                for iy in 0..self.input.height {
                    for ix in 0..self.input.width {
                        let v = input[in_base + iy * self.input.width + ix];
                        for oc in 0..self.kernel.out_channels {
                            for ky in 0..self.kernel.height {
                                for kx in 0..self.kernel.width {
                                    if let Some((oy, ox)) = self.target(iy, ix, ky, kx) {
                                        out_b[oc * out_spatial + oy * self.output.width + ox] +=
                                            v * params.weights[self.weight_index(oc, ic, ky, kx)];
                                    }
                                }
                            }
                        }
                    }
                }
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
        let mut gradient = ParameterGradient::zeros(&self.kernel);
        let in_size = self.input.element_count();
        let out_size = self.output.element_count();
        let in_spatial = self.input.spatial();
        let out_spatial = self.output.spatial();

        for b in 0..batch_size {
            let g_b = &grad_output[b * out_size..(b + 1) * out_size];
            for (oc, plane) in g_b.chunks_exact(out_spatial).enumerate() {
                gradient.biases[oc] += plane.iter().sum::<f32>();
            }

            for ic in 0..self.kernel.in_channels {
                let in_base = b * in_size + ic * in_spatial;
                for iy in 0..self.input.height {
                    for ix in 0..self.input.width {
                        let in_idx = in_base + iy * self.input.width + ix;
                        let v = input[in_idx];
                        let mut acc = 0.0f32;
                        for oc in 0..self.kernel.out_channels {
                            for ky in 0..self.kernel.height {
                                for kx in 0..self.kernel.width {
                                    if let Some((oy, ox)) = self.target(iy, ix, ky, kx) {
                                        let g = g_b[oc * out_spatial + oy * self.output.width + ox];
                                        let w_idx = self.weight_index(oc, ic, ky, kx);
                                        gradient.weights[w_idx] += g * v;
                                        acc += g * weights[w_idx];
                                    }
                                }
                            }
                        }
                        grad_input[in_idx] = acc;
                    }
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

    #[test]
    fn test_same_padding_doubles_extent() {
        assert_eq!(transpose_axis(7, 3, 2, Padding::Same).unwrap().out, 14);
        assert_eq!(transpose_axis(14, 3, 2, Padding::Same).unwrap().out, 28);
        assert_eq!(transpose_axis(4, 3, 2, Padding::Valid).unwrap().out, 9);
    }

    #[test]
    fn test_ones_kernel_scatter() {
        let kernel = KernelShape::new(2, 2, 1, 1);
        let mut store = ParameterStore::initialize(
            "ConvT1",
            kernel,
            2,
            AdamHyperparameters::default(),
            1,
        )
        .unwrap();
        let mut state = store.state().clone();
        state.weights = vec![1.0; 4];
        store.load_state(state).unwrap();

        let op = ConvolutionTransposeOp::new(
            store.into_shared(),
            kernel,
            2,
            Padding::Same,
            ImageShape::new(2, 1, 1),
        )
        .unwrap();
        assert_eq!(op.output_shape(), ImageShape::new(4, 2, 1));

        let mut output = vec![0.0; 8];
        op.forward(&[1.0, 2.0], &mut output, 1, &mut NodeScratch::new(SimpleRng::new(1)))
            .unwrap();
        assert_eq!(output, vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);

        let mut grad_input = vec![0.0; 2];
        let gradient = op
            .backward(
                &[1.0, 2.0],
                &output,
                &[1.0; 8],
                &mut grad_input,
                1,
                &NodeScratch::new(SimpleRng::new(1)),
            )
            .unwrap()
            .unwrap();
        assert_eq!(grad_input, vec![4.0, 4.0]);
        assert_eq!(gradient.biases, vec![8.0]);
        assert_eq!(gradient.weights, vec![3.0; 4]);
    }
}
