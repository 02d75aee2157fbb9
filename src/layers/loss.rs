//! Mean squared error loss, the terminal node of a training graph

use crate::error::{EngineError, Result};
use crate::layers::Reduction;
use crate::tensor::ImageShape;

/// Per-sample losses and the gradient with respect to the network output.
#[derive(Debug, Clone, PartialEq)]
pub struct LossOutput {
    pub per_sample: Vec<f32>,
    pub gradient: Vec<f32>,
}

/// Batch loss: the mean of the per-sample losses, 0 for an empty batch.
pub fn batch_loss(per_sample: &[f32]) -> f32 {
    if per_sample.is_empty() {
        0.0
    } else {
        per_sample.iter().sum::<f32>() / per_sample.len() as f32
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MseLoss {
    reduction: Reduction,
    input: ImageShape,
}

impl MseLoss {
    pub fn new(reduction: Reduction, input: ImageShape) -> Result<Self> {
        if reduction == Reduction::None {
            return Err(EngineError::config(
                "mse with reduction `none` yields a non-scalar loss per sample",
            ));
        }
        Ok(Self { reduction, input })
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    pub fn input_shape(&self) -> ImageShape {
        self.input
    }

    /// Loss of `output` against `targets` for a batch of `batch_size` samples.
    ///
    /// The gradient is taken with respect to the batch-mean loss.
    pub fn evaluate(&self, output: &[f32], targets: &[f32], batch_size: usize) -> Result<LossOutput> {
        let features = self.input.element_count();
        if output.len() != batch_size * features || targets.len() != output.len() {
            return Err(EngineError::GraphEncoding(format!(
                "loss expects {} outputs and targets, got {} and {}",
                batch_size * features,
                output.len(),
                targets.len()
            )));
        }

        let norm = match self.reduction {
            Reduction::Mean => features as f32,
            _ => 1.0,
        };
        let grad_scale = 2.0 / (norm * batch_size as f32);

        let mut per_sample = Vec::with_capacity(batch_size);
        let mut gradient = Vec::with_capacity(output.len());
        for (y, t) in output.chunks_exact(features).zip(targets.chunks_exact(features)) {
            let mut total = 0.0f32;
            for (&yi, &ti) in y.iter().zip(t) {
                let diff = yi - ti;
                total += diff * diff;
                gradient.push(grad_scale * diff);
            }
            per_sample.push(total / norm);
        }

        Ok(LossOutput {
            per_sample,
            gradient,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mean_reduction() {
        let loss = MseLoss::new(Reduction::Mean, ImageShape::vector(2)).unwrap();
        let out = loss
            .evaluate(&[1.0, 0.0, 0.5, 0.5], &[0.0, 0.0, 0.5, 1.5], 2)
            .unwrap();
        assert_relative_eq!(out.per_sample[0], 0.5);
        assert_relative_eq!(out.per_sample[1], 0.5);
        assert_relative_eq!(batch_loss(&out.per_sample), 0.5);
        // 2 * diff / (features * batch)
        assert_relative_eq!(out.gradient[0], 0.5);
        assert_relative_eq!(out.gradient[3], -0.5);
    }

    #[test]
    fn test_batch_loss_of_empty_batch() {
        assert_eq!(batch_loss(&[]), 0.0);
        assert_relative_eq!(batch_loss(&[0.25, 0.75, 2.0]), 1.0);
    }

    #[test]
    fn test_sum_reduction() {
        let loss = MseLoss::new(Reduction::Sum, ImageShape::vector(2)).unwrap();
        let out = loss.evaluate(&[1.0, 1.0], &[0.0, 0.0], 1).unwrap();
        assert_relative_eq!(out.per_sample[0], 2.0);
        assert_relative_eq!(out.gradient[0], 2.0);
    }

    #[test]
    fn test_none_reduction_rejected() {
        assert!(MseLoss::new(Reduction::None, ImageShape::vector(2)).is_err());
    }

    #[test]
    fn test_target_length_mismatch() {
        let loss = MseLoss::new(Reduction::Mean, ImageShape::vector(3)).unwrap();
        let err = loss.evaluate(&[0.0; 3], &[0.0; 2], 1).unwrap_err();
        assert!(matches!(err, EngineError::GraphEncoding(_)));
    }
}
