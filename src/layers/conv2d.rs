//! 2D convolution node
//!
//! Slides `out_channels` filters over the input. Weights are laid out as
//! `[out_channels][in_channels][kernel_height][kernel_width]`.

use crate::error::{EngineError, Result};
use crate::layers::{GraphOp, NodeScratch, Padding};
use crate::parameter_store::{read_store, KernelShape, ParameterGradient, SharedParameterStore};
use crate::tensor::ImageShape;

/// Output extent and leading padding along one spatial axis of a window op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AxisGeometry {
    pub out: usize,
    pub pad_before: usize,
}

/// Geometry of a convolution or pooling window along one axis.
///
/// `Same` gives `ceil(input / stride)` outputs with the padding split so the
/// extra cell (if any) goes after the input; `Valid` pads nothing.
pub(crate) fn window_axis(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Result<AxisGeometry> {
    if kernel == 0 || stride == 0 {
        return Err(EngineError::config("kernel and stride must be positive"));
    }
    match padding {
        Padding::Same => {
            let out = (input + stride - 1) / stride;
            let pad_total = ((out.max(1) - 1) * stride + kernel).saturating_sub(input);
            Ok(AxisGeometry {
                out,
                pad_before: pad_total / 2,
            })
        }
        Padding::Valid => {
            if input < kernel {
                return Err(EngineError::config(format!(
                    "valid padding needs input extent {} >= kernel {}",
                    input, kernel
                )));
            }
            Ok(AxisGeometry {
                out: (input - kernel) / stride + 1,
                pad_before: 0,
            })
        }
    }
}

/// Convolution with a trainable kernel.
pub struct ConvolutionOp {
    store: SharedParameterStore,
    kernel: KernelShape,
    stride: usize,
    input: ImageShape,
    output: ImageShape,
    pad_top: usize,
    pad_left: usize,
}

impl ConvolutionOp {
    pub fn new(
        store: SharedParameterStore,
        kernel: KernelShape,
        stride: usize,
        padding: Padding,
        input: ImageShape,
    ) -> Result<Self> {
        if input.channels != kernel.in_channels {
            return Err(EngineError::config(format!(
                "convolution expects {} input channels, upstream produces {}",
                kernel.in_channels, input.channels
            )));
        }
        let rows = window_axis(input.height, kernel.height, stride, padding)?;
        let cols = window_axis(input.width, kernel.width, stride, padding)?;
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

    /// Input pixel under kernel tap (ky, kx) for output pixel (oy, ox), if inside the image.
    fn source(&self, oy: usize, ox: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
        let iy = (oy * self.stride + ky).checked_sub(self.pad_top)?;
        let ix = (ox * self.stride + kx).checked_sub(self.pad_left)?;
        (iy < self.input.height && ix < self.input.width).then_some((iy, ix))
    }

    fn weight_index(&self, oc: usize, ic: usize, ky: usize, kx: usize) -> usize {
        ((oc * self.kernel.in_channels + ic) * self.kernel.height + ky) * self.kernel.width + kx
    }
}

impl GraphOp for ConvolutionOp {
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
            let in_base = b * in_size;
            let out_base_b = b * out_size;

            for oc in 0..self.kernel.out_channels {
                let bias = params.biases[oc];
                let out_base = out_base_b + oc * out_spatial;

                for oy in 0..self.output.height {
                    for ox in 0..self.output.width {
                        let mut sum = bias;
                        for ic in 0..self.kernel.in_channels {
                            let in_base_c = in_base + ic * in_spatial;
                            for ky in 0..self.kernel.height {
                                for kx in 0..self.kernel.width {
                                    if let Some((iy, ix)) = self.source(oy, ox, ky, kx) {
                                        sum += input[in_base_c + iy * self.input.width + ix]
                                            * params.weights[self.weight_index(oc, ic, ky, kx)];
                                    }
                                }
                            }
                        }
                        output[out_base + oy * self.output.width + ox] = sum;
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

        grad_input.iter_mut().for_each(|v| *v = 0.0);

        for b in 0..batch_size {
            let in_base = b * in_size;
            let g_base_b = b * out_size;

            for oc in 0..self.kernel.out_channels {
                let g_base = g_base_b + oc * out_spatial;

                for oy in 0..self.output.height {
                    for ox in 0..self.output.width {
                        let g = grad_output[g_base + oy * self.output.width + ox];
                        gradient.biases[oc] += g;

                        for ic in 0..self.kernel.in_channels {
                            let in_base_c = in_base + ic * in_spatial;
                            for ky in 0..self.kernel.height {
                                for kx in 0..self.kernel.width {
                                    if let Some((iy, ix)) = self.source(oy, ox, ky, kx) {
                                        let in_idx = in_base_c + iy * self.input.width + ix;
                                        let w_idx = self.weight_index(oc, ic, ky, kx);
                                        gradient.weights[w_idx] += g * input[in_idx];
                                        grad_input[in_idx] += g * weights[w_idx];
                                    }
                                }
                            }
                        }
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
