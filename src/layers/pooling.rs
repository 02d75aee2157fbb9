//! Max and average pooling nodes
//!
//! Windows are applied per channel. Padded cells never win a max and are left
//! out of an average, so border windows average only the real pixels.

use crate::error::Result;
use crate::layers::{GraphOp, NodeScratch, Padding, PoolingMode};
use crate::parameter_store::ParameterGradient;
use crate::tensor::ImageShape;

use super::conv2d::window_axis;

pub struct PoolingOp {
    mode: PoolingMode,
    filter_size: usize,
    stride: usize,
    input: ImageShape,
    output: ImageShape,
    pad_top: usize,
    pad_left: usize,
}

impl PoolingOp {
    pub fn new(
        mode: PoolingMode,
        filter_size: usize,
        stride: usize,
        padding: Padding,
        input: ImageShape,
    ) -> Result<Self> {
        let rows = window_axis(input.height, filter_size, stride, padding)?;
        let cols = window_axis(input.width, filter_size, stride, padding)?;
        Ok(Self {
            mode,
            filter_size,
            stride,
            input,
            output: ImageShape::new(cols.out, rows.out, input.channels),
            pad_top: rows.pad_before,
            pad_left: cols.pad_before,
        })
    }

    pub fn mode(&self) -> PoolingMode {
        self.mode
    }

    /// In-image offsets (within one channel plane) covered by output pixel (oy, ox).
    fn window(&self, oy: usize, ox: usize) -> impl Iterator<Item = usize> + '_ {
        let y0 = oy * self.stride;
        let x0 = ox * self.stride;
        (0..self.filter_size).flat_map(move |ky| {
            (0..self.filter_size).filter_map(move |kx| {
                let iy = (y0 + ky).checked_sub(self.pad_top)?;
                let ix = (x0 + kx).checked_sub(self.pad_left)?;
                (iy < self.input.height && ix < self.input.width)
                    .then_some(iy * self.input.width + ix)
            })
        })
    }

    /// Offset of the first maximum in the window, if the window touches the image.
    fn argmax(&self, plane: &[f32], oy: usize, ox: usize) -> Option<usize> {
        let mut best: Option<usize> = None;
        for idx in self.window(oy, ox) {
            match best {
                Some(b) if plane[idx] <= plane[b] => {}
                _ => best = Some(idx),
            }
        }
        best
    }

    fn planes(&self, batch_size: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        let in_spatial = self.input.spatial();
        let out_spatial = self.output.spatial();
        (0..batch_size * self.input.channels).map(move |p| (p * in_spatial, p * out_spatial))
    }
}

impl GraphOp for PoolingOp {
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
        let in_spatial = self.input.spatial();
        for (in_base, out_base) in self.planes(batch_size) {
            let plane = &input[in_base..in_base + in_spatial];
            for oy in 0..self.output.height {
                for ox in 0..self.output.width {
                    let value = match self.mode {
                        PoolingMode::Max => self.argmax(plane, oy, ox).map_or(0.0, |i| plane[i]),
                        PoolingMode::Average => {
                            let (sum, count) = self
                                .window(oy, ox)
                                .fold((0.0f32, 0usize), |(s, c), i| (s + plane[i], c + 1));
                            if count == 0 {
                                0.0
                            } else {
                                sum / count as f32
                            }
                        }
                    };
                    output[out_base + oy * self.output.width + ox] = value;
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
        let in_spatial = self.input.spatial();
        grad_input.iter_mut().for_each(|v| *v = 0.0);

        for (in_base, out_base) in self.planes(batch_size) {
            let plane = &input[in_base..in_base + in_spatial];
            for oy in 0..self.output.height {
                for ox in 0..self.output.width {
                    let g = grad_output[out_base + oy * self.output.width + ox];
                    match self.mode {
                        PoolingMode::Max => {
                            if let Some(i) = self.argmax(plane, oy, ox) {
                                grad_input[in_base + i] += g;
                            }
                        }
                        PoolingMode::Average => {
                            let count = self.window(oy, ox).count();
                            if count > 0 {
                                let share = g / count as f32;
                                for i in self.window(oy, ox) {
                                    grad_input[in_base + i] += share;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(None)
    }
}
