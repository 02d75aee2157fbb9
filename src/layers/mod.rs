//! Layer specifications and the graph ops they instantiate
//!
//! A [`LayerSpec`] is an immutable description of one layer. Compiling a
//! model instantiates every spec twice (once for the training graph, once for
//! the inference graph) through a shared [`BuildContext`], so both graphs see
//! the same labels and the same parameter stores.

mod r#trait;
pub mod activation;
pub mod conv2d;
pub mod conv_transpose;
pub mod dense;
pub mod dropout;
pub mod flatten;
pub mod loss;
pub mod pooling;

pub use activation::{ReluOp, SigmoidOp};
pub use conv2d::ConvolutionOp;
pub use conv_transpose::ConvolutionTransposeOp;
pub use dense::FullyConnectedOp;
pub use dropout::DropoutOp;
pub use flatten::FlattenOp;
pub use loss::MseLoss;
pub use pooling::PoolingOp;
pub use r#trait::{GraphOp, NodeScratch};

use crate::error::{EngineError, Result};
use crate::graph::{GraphKind, GraphNode, NodeHandle, NodeOp};
use crate::optimizers::AdamHyperparameters;
use crate::parameter_store::{read_store, KernelShape, ParameterStore, SharedParameterStore};
use crate::tensor::ImageShape;
use crate::utils::SimpleRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Same,
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingMode {
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Relu,
    Sigmoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    #[serde(rename = "mse")]
    MeanSquaredError,
}

/// How per-feature losses are folded into one value per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossSpec {
    pub kind: LossKind,
    #[serde(default)]
    pub reduction: Reduction,
}

impl LossSpec {
    pub fn mse(reduction: Reduction) -> Self {
        Self {
            kind: LossKind::MeanSquaredError,
            reduction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvolutionSpec {
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub input_channels: usize,
    pub output_channels: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default)]
    pub padding: Padding,
}

impl ConvolutionSpec {
    fn kernel(&self) -> KernelShape {
        KernelShape::new(
            self.kernel_width,
            self.kernel_height,
            self.input_channels,
            self.output_channels,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenseSpec {
    pub input_channels: usize,
    pub output_channels: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolingSpec {
    pub mode: PoolingMode,
    pub filter_size: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default)]
    pub padding: Padding,
}

fn default_stride() -> usize {
    1
}

/// One layer of a sequential model.
///
/// In JSON the variant is selected by a `layer_type` field:
///
/// ```json
/// { "layer_type": "convolution", "kernel_width": 3, "kernel_height": 3,
///   "input_channels": 1, "output_channels": 8, "stride": 1, "padding": "same" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer_type", rename_all = "snake_case")]
pub enum LayerSpec {
    Convolution(ConvolutionSpec),
    ConvolutionTranspose(ConvolutionSpec),
    Dense(DenseSpec),
    Pooling(PoolingSpec),
    Activation { activation: ActivationKind },
    Flatten { width: usize },
    Dropout { keep_probability: f32 },
    Loss(LossSpec),
}

impl LayerSpec {
    pub fn convolution(
        kernel: (usize, usize),
        input_channels: usize,
        output_channels: usize,
        stride: usize,
        padding: Padding,
    ) -> Self {
        LayerSpec::Convolution(ConvolutionSpec {
            kernel_width: kernel.0,
            kernel_height: kernel.1,
            input_channels,
            output_channels,
            stride,
            padding,
        })
    }

    pub fn convolution_transpose(
        kernel: (usize, usize),
        input_channels: usize,
        output_channels: usize,
        stride: usize,
        padding: Padding,
    ) -> Self {
        LayerSpec::ConvolutionTranspose(ConvolutionSpec {
            kernel_width: kernel.0,
            kernel_height: kernel.1,
            input_channels,
            output_channels,
            stride,
            padding,
        })
    }

    pub fn dense(input_channels: usize, output_channels: usize) -> Self {
        LayerSpec::Dense(DenseSpec {
            input_channels,
            output_channels,
        })
    }

    pub fn pooling(mode: PoolingMode, filter_size: usize, stride: usize, padding: Padding) -> Self {
        LayerSpec::Pooling(PoolingSpec {
            mode,
            filter_size,
            stride,
            padding,
        })
    }

    pub fn relu() -> Self {
        LayerSpec::Activation {
            activation: ActivationKind::Relu,
        }
    }

    pub fn sigmoid() -> Self {
        LayerSpec::Activation {
            activation: ActivationKind::Sigmoid,
        }
    }

    pub fn flatten(width: usize) -> Self {
        LayerSpec::Flatten { width }
    }

    pub fn dropout(keep_probability: f32) -> Self {
        LayerSpec::Dropout { keep_probability }
    }

    pub fn mse(reduction: Reduction) -> Self {
        LayerSpec::Loss(LossSpec::mse(reduction))
    }

    pub fn is_loss(&self) -> bool {
        matches!(self, LayerSpec::Loss(_))
    }

    /// Counter prefix used to label instantiated nodes (`Conv1`, `Dense2`, ...).
    pub fn label_prefix(&self) -> &'static str {
        match self {
            LayerSpec::Convolution(_) => "Conv",
            LayerSpec::ConvolutionTranspose(_) => "ConvT",
            LayerSpec::Dense(_) => "Dense",
            LayerSpec::Pooling(_) => "Pool",
            LayerSpec::Activation {
                activation: ActivationKind::Relu,
            } => "ReLU",
            LayerSpec::Activation {
                activation: ActivationKind::Sigmoid,
            } => "Sigmoid",
            LayerSpec::Flatten { .. } => "Flatten",
            LayerSpec::Dropout { .. } => "Dropout",
            LayerSpec::Loss(_) => "Loss",
        }
    }

    /// Check sizes that do not depend on the upstream shape.
    pub fn validate(&self) -> Result<()> {
        match self {
            LayerSpec::Convolution(spec) | LayerSpec::ConvolutionTranspose(spec) => {
                if spec.kernel().weight_len() == 0 {
                    return Err(EngineError::config(format!(
                        "{}: kernel sizes and channel counts must be positive",
                        self.label_prefix()
                    )));
                }
                if spec.stride == 0 {
                    return Err(EngineError::config(format!(
                        "{}: stride must be positive",
                        self.label_prefix()
                    )));
                }
            }
            LayerSpec::Dense(spec) => {
                if spec.input_channels == 0 || spec.output_channels == 0 {
                    return Err(EngineError::config(
                        "Dense: channel counts must be positive",
                    ));
                }
            }
            LayerSpec::Pooling(spec) => {
                if spec.filter_size == 0 || spec.stride == 0 {
                    return Err(EngineError::config(
                        "Pool: filter size and stride must be positive",
                    ));
                }
            }
            LayerSpec::Flatten { width } => {
                if *width == 0 {
                    return Err(EngineError::config("Flatten: width must be positive"));
                }
            }
            LayerSpec::Dropout { keep_probability } => {
                if !(*keep_probability > 0.0 && *keep_probability <= 1.0) {
                    return Err(EngineError::config(format!(
                        "Dropout: keep probability {} outside (0, 1]",
                        keep_probability
                    )));
                }
            }
            LayerSpec::Loss(spec) => {
                if spec.reduction == Reduction::None {
                    return Err(EngineError::config(
                        "Loss: reduction `none` does not produce a scalar per sample",
                    ));
                }
            }
            LayerSpec::Activation { .. } => {}
        }
        Ok(())
    }

    /// Build the graph node for this layer on top of `upstream`.
    pub fn instantiate(&self, upstream: &NodeHandle, ctx: &mut BuildContext) -> Result<GraphNode> {
        self.validate()?;
        let input = upstream.shape;
        let label = ctx.label_for(self.label_prefix());

        let op: NodeOp = match self {
            LayerSpec::Convolution(spec) => {
                let kernel = spec.kernel();
                let store = ctx.parameter_store(&label, kernel, spec.stride)?;
                NodeOp::Forward(Box::new(ConvolutionOp::new(
                    store,
                    kernel,
                    spec.stride,
                    spec.padding,
                    input,
                )?))
            }
            LayerSpec::ConvolutionTranspose(spec) => {
                let kernel = spec.kernel();
                let store = ctx.parameter_store(&label, kernel, spec.stride)?;
                NodeOp::Forward(Box::new(ConvolutionTransposeOp::new(
                    store,
                    kernel,
                    spec.stride,
                    spec.padding,
                    input,
                )?))
            }
            LayerSpec::Dense(spec) => {
                let kernel = KernelShape::new(1, 1, spec.input_channels, spec.output_channels);
                let store = ctx.parameter_store(&label, kernel, 1)?;
                NodeOp::Forward(Box::new(FullyConnectedOp::new(store, kernel, input)?))
            }
            LayerSpec::Pooling(spec) => NodeOp::Forward(Box::new(PoolingOp::new(
                spec.mode,
                spec.filter_size,
                spec.stride,
                spec.padding,
                input,
            )?)),
            LayerSpec::Activation { activation } => match activation {
                ActivationKind::Relu => NodeOp::Forward(Box::new(ReluOp::new(input))),
                ActivationKind::Sigmoid => NodeOp::Forward(Box::new(SigmoidOp::new(input))),
            },
            LayerSpec::Flatten { width } => {
                NodeOp::Forward(Box::new(FlattenOp::new(*width, input)?))
            }
            LayerSpec::Dropout { keep_probability } => NodeOp::Forward(Box::new(DropoutOp::new(
                *keep_probability,
                ctx.kind() == GraphKind::Training,
                input,
            )?)),
            LayerSpec::Loss(spec) => {
                if ctx.kind() != GraphKind::Training {
                    return Err(EngineError::config(
                        "loss layers only belong to training graphs",
                    ));
                }
                NodeOp::Loss(MseLoss::new(spec.reduction, input)?)
            }
        };

        GraphNode::new(label, input, op)
    }
}

/// Creates each layer's store once and hands the same store to every graph.
#[derive(Debug)]
pub struct ParameterStoreFactory {
    hyperparameters: AdamHyperparameters,
    rng: SimpleRng,
    stores: BTreeMap<usize, SharedParameterStore>,
}

impl ParameterStoreFactory {
    pub fn new(hyperparameters: AdamHyperparameters, seed: u64) -> Self {
        Self {
            hyperparameters,
            rng: SimpleRng::new(seed),
            stores: BTreeMap::new(),
        }
    }

    /// The store for `layer_index`, created on first request.
    pub fn store_for(
        &mut self,
        layer_index: usize,
        name: &str,
        shape: KernelShape,
        stride: usize,
    ) -> Result<SharedParameterStore> {
        if let Some(existing) = self.stores.get(&layer_index) {
            let guard = read_store(existing)?;
            if guard.shape() != shape {
                return Err(EngineError::config(format!(
                    "{}: kernel {:?} does not match existing store {:?}",
                    name,
                    shape,
                    guard.shape()
                )));
            }
            drop(guard);
            return Ok(existing.clone());
        }

        let seed = self.rng.fork(layer_index as u64).next_u64();
        let store =
            ParameterStore::initialize(name, shape, stride, self.hyperparameters, seed)?.into_shared();
        self.stores.insert(layer_index, store.clone());
        Ok(store)
    }

    /// Stores ordered by layer index.
    pub fn into_stores(self) -> Vec<SharedParameterStore> {
        self.stores.into_values().collect()
    }
}

/// Shared state for one compile: labels, counters and parameter stores.
#[derive(Debug)]
pub struct BuildContext {
    kind: GraphKind,
    layer_index: usize,
    counters: HashMap<&'static str, usize>,
    labels: HashMap<usize, String>,
    factory: ParameterStoreFactory,
}

impl BuildContext {
    pub fn new(hyperparameters: AdamHyperparameters, seed: u64) -> Self {
        Self {
            kind: GraphKind::Training,
            layer_index: 0,
            counters: HashMap::new(),
            labels: HashMap::new(),
            factory: ParameterStoreFactory::new(hyperparameters, seed),
        }
    }

    pub fn begin_graph(&mut self, kind: GraphKind) {
        self.kind = kind;
        self.layer_index = 0;
    }

    pub fn enter_layer(&mut self, layer_index: usize) {
        self.layer_index = layer_index;
    }

    pub fn kind(&self) -> GraphKind {
        self.kind
    }

    /// Label of the current layer. The first build of a layer index takes
    /// the next counter value for `prefix`; later builds reuse it.
    pub fn label_for(&mut self, prefix: &'static str) -> String {
        if let Some(label) = self.labels.get(&self.layer_index) {
            return label.clone();
        }
        let counter = self.counters.entry(prefix).or_insert(0);
        *counter += 1;
        let label = format!("{}{}", prefix, counter);
        self.labels.insert(self.layer_index, label.clone());
        label
    }

    pub fn parameter_store(
        &mut self,
        name: &str,
        shape: KernelShape,
        stride: usize,
    ) -> Result<SharedParameterStore> {
        self.factory.store_for(self.layer_index, name, shape, stride)
    }

    pub fn into_stores(self) -> Vec<SharedParameterStore> {
        self.factory.into_stores()
    }
}

/// Output shape of `layers` applied to `input`. Loss layers are skipped.
pub fn infer_shape(input: ImageShape, layers: &[LayerSpec]) -> Result<ImageShape> {
    let mut ctx = BuildContext::new(AdamHyperparameters::default(), 0);
    ctx.begin_graph(GraphKind::Inference);
    let mut handle = NodeHandle::input(input);
    for (index, layer) in layers.iter().filter(|l| !l.is_loss()).enumerate() {
        ctx.enter_layer(index);
        let node = layer.instantiate(&handle, &mut ctx)?;
        handle = node.handle();
    }
    Ok(handle.shape)
}
