//! Architecture configuration structures
//!
//! This module lets a model be described in a JSON file instead of code, so
//! architectures can be changed without rebuilding.

use crate::config::TrainingConfig;
use crate::error::{EngineError, Result};
use crate::layers::{infer_shape, LayerSpec};
use crate::sequential::Sequential;
use crate::tensor::ImageShape;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration for an entire sequential model.
///
/// Layers are applied in the order they appear. A `loss` layer, if present,
/// must be the last one.
///
/// # Example
///
/// ```json
/// {
///   "input": { "width": 28, "height": 28, "channels": 1 },
///   "layers": [
///     { "layer_type": "convolution", "kernel_width": 3, "kernel_height": 3,
///       "input_channels": 1, "output_channels": 8, "stride": 1, "padding": "same" },
///     { "layer_type": "activation", "activation": "relu" },
///     { "layer_type": "pooling", "mode": "max", "filter_size": 2, "stride": 2 },
///     { "layer_type": "flatten", "width": 1568 },
///     { "layer_type": "dense", "input_channels": 1568, "output_channels": 10 },
///     { "layer_type": "activation", "activation": "sigmoid" },
///     { "layer_type": "loss", "kind": "mse", "reduction": "mean" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Shape of one input image
    pub input: ImageShape,

    /// Sequence of layers defining the network
    pub layers: Vec<LayerSpec>,
}

/// Loads an architecture configuration from a JSON file and validates it.
///
/// # Examples
///
/// ```no_run
/// use sequential_trainer::architecture::load_architecture;
///
/// let arch = load_architecture("config/architectures/mnist_classifier.json").unwrap();
/// assert!(!arch.layers.is_empty());
/// ```
pub fn load_architecture(path: impl AsRef<Path>) -> Result<ArchitectureConfig> {
    let contents = fs::read_to_string(path)?;
    let config: ArchitectureConfig = serde_json::from_str(&contents)?;
    validate_architecture(&config)?;
    Ok(config)
}

/// Validates the complete architecture configuration.
///
/// Checks that there is at least one layer, that only the last layer is a
/// loss, that every layer's own sizes are valid, and that each layer accepts
/// the shape produced by the one before it.
pub fn validate_architecture(config: &ArchitectureConfig) -> Result<()> {
    if config.layers.is_empty() {
        return Err(EngineError::config(
            "Architecture must have at least one layer",
        ));
    }
    if config.input.element_count() == 0 {
        return Err(EngineError::config(format!(
            "Input shape {} has no elements",
            config.input
        )));
    }

    let last = config.layers.len() - 1;
    for (i, layer) in config.layers.iter().enumerate() {
        if layer.is_loss() && i != last {
            return Err(EngineError::config(format!(
                "Layer {}: a loss layer must be the last layer",
                i
            )));
        }
        layer
            .validate()
            .map_err(|err| EngineError::config(format!("Layer {}: {}", i, err)))?;
    }

    infer_shape(config.input, &config.layers)?;
    Ok(())
}

/// Builds an uncompiled model from an architecture configuration.
pub fn build_model(config: &ArchitectureConfig, training: TrainingConfig) -> Result<Sequential> {
    validate_architecture(config)?;
    Sequential::with_layers(config.input, training, config.layers.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Padding, Reduction};

    fn arch(layers: Vec<LayerSpec>) -> ArchitectureConfig {
        ArchitectureConfig {
            input: ImageShape::new(4, 4, 1),
            layers,
        }
    }

    #[test]
    fn test_valid_architecture() {
        let config = arch(vec![
            LayerSpec::convolution((3, 3), 1, 2, 1, Padding::Same),
            LayerSpec::flatten(32),
            LayerSpec::dense(32, 3),
            LayerSpec::mse(Reduction::Mean),
        ]);
        assert!(validate_architecture(&config).is_ok());
        let model = build_model(&config, TrainingConfig::default()).unwrap();
        assert_eq!(model.layers().len(), 4);
    }

    #[test]
    fn test_connection_mismatch() {
        let config = arch(vec![LayerSpec::flatten(16), LayerSpec::dense(15, 3)]);
        assert!(validate_architecture(&config).is_err());
    }

    #[test]
    fn test_empty_and_misplaced_loss() {
        assert!(validate_architecture(&arch(vec![])).is_err());
        let config = arch(vec![LayerSpec::mse(Reduction::Mean), LayerSpec::flatten(16)]);
        assert!(validate_architecture(&config).is_err());
    }
}
