//! Compiled execution graphs
//!
//! A [`Graph`] is a linear chain of nodes built from a layer list. Training
//! graphs end in a loss node and run forward, backward and the optimizer
//! update; inference graphs end in a softmax and only run forward.

use crate::error::{EngineError, Result};
use crate::layers::{GraphOp, MseLoss, NodeScratch};
use crate::parameter_store::{write_store, ParameterGradient, SharedParameterStore};
use crate::tensor::{ImageBatch, ImageShape};
use crate::utils::{softmax_rows, SimpleRng};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    Training,
    Inference,
}

/// The tail of a graph under construction: what the next layer attaches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    pub label: Option<String>,
    pub shape: ImageShape,
}

impl NodeHandle {
    pub fn input(shape: ImageShape) -> Self {
        Self { label: None, shape }
    }
}

pub enum NodeOp {
    Forward(Box<dyn GraphOp>),
    Loss(MseLoss),
    Softmax,
}

pub struct GraphNode {
    label: String,
    input_shape: ImageShape,
    output_shape: ImageShape,
    op: NodeOp,
}

impl GraphNode {
    pub fn new(label: String, input_shape: ImageShape, op: NodeOp) -> Result<Self> {
        let output_shape = match &op {
            NodeOp::Forward(forward) => {
                if forward.input_shape() != input_shape {
                    return Err(EngineError::config(format!(
                        "{}: op consumes {}, upstream produces {}",
                        label,
                        forward.input_shape(),
                        input_shape
                    )));
                }
                forward.output_shape()
            }
            NodeOp::Loss(_) | NodeOp::Softmax => input_shape,
        };
        Ok(Self {
            label,
            input_shape,
            output_shape,
            op,
        })
    }

    pub fn softmax(input_shape: ImageShape) -> Self {
        Self {
            label: "Softmax".into(),
            input_shape,
            output_shape: input_shape,
            op: NodeOp::Softmax,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn input_shape(&self) -> ImageShape {
        self.input_shape
    }

    pub fn output_shape(&self) -> ImageShape {
        self.output_shape
    }

    pub fn op(&self) -> &NodeOp {
        &self.op
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            label: Some(self.label.clone()),
            shape: self.output_shape,
        }
    }

    pub fn parameter_store(&self) -> Option<&SharedParameterStore> {
        match &self.op {
            NodeOp::Forward(op) => op.parameter_store(),
            _ => None,
        }
    }
}

pub struct Graph {
    kind: GraphKind,
    input_shape: ImageShape,
    nodes: Vec<GraphNode>,
}

impl Graph {
    /// Assemble a graph. Training graphs must end in exactly one loss node,
    /// inference graphs in a softmax.
    pub fn new(kind: GraphKind, input_shape: ImageShape, nodes: Vec<GraphNode>) -> Result<Self> {
        let forward_count = nodes
            .iter()
            .filter(|n| matches!(n.op, NodeOp::Forward(_)))
            .count();
        if forward_count == 0 {
            return Err(EngineError::config("graph has no forward layers"));
        }
        let terminal_ok = match (kind, nodes.last().map(|n| &n.op)) {
            (GraphKind::Training, Some(NodeOp::Loss(_))) => true,
            (GraphKind::Inference, Some(NodeOp::Softmax)) => true,
            _ => false,
        };
        if !terminal_ok || forward_count + 1 != nodes.len() {
            return Err(EngineError::config(format!(
                "{:?} graph must be forward layers followed by one terminal node",
                kind
            )));
        }
        Ok(Self {
            kind,
            input_shape,
            nodes,
        })
    }

    pub fn kind(&self) -> GraphKind {
        self.kind
    }

    pub fn input_shape(&self) -> ImageShape {
        self.input_shape
    }

    pub fn output_shape(&self) -> ImageShape {
        self.nodes
            .last()
            .map_or(self.input_shape, GraphNode::output_shape)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node_labels(&self) -> Vec<&str> {
        self.nodes.iter().map(GraphNode::label).collect()
    }

    pub fn node(&self, label: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.label == label)
    }

    pub(crate) fn check_batch(&self, batch: &ImageBatch) -> Result<()> {
        match batch.image_shape() {
            None => Err(EngineError::GraphEncoding("empty batch".into())),
            Some(shape) if shape != self.input_shape => Err(EngineError::GraphEncoding(format!(
                "batch images are {}, graph expects {}",
                shape, self.input_shape
            ))),
            Some(_) => Ok(()),
        }
    }

    fn forward_ops(&self) -> impl Iterator<Item = &dyn GraphOp> {
        self.nodes.iter().filter_map(|n| match &n.op {
            NodeOp::Forward(op) => Some(op.as_ref()),
            _ => None,
        })
    }

    /// Run the forward chain, keeping every intermediate activation.
    fn forward_all(
        &self,
        batch: &ImageBatch,
        scratch: &mut [NodeScratch],
    ) -> Result<Vec<Vec<f32>>> {
        let batch_size = batch.len();
        let mut activations = vec![batch.flatten_images()];
        for (op, scratch) in self.forward_ops().zip(scratch.iter_mut()) {
            let mut output = vec![0.0f32; batch_size * op.output_shape().element_count()];
            let input = activations.last().map(Vec::as_slice).unwrap_or_default();
            op.forward(input, &mut output, batch_size, scratch)?;
            activations.push(output);
        }
        Ok(activations)
    }

    fn scratch_for(&self, rng: &mut SimpleRng) -> Vec<NodeScratch> {
        self.forward_ops()
            .enumerate()
            .map(|(i, _)| NodeScratch::new(rng.fork(i as u64)))
            .collect()
    }

    /// Forward pass and softmax; returns one probability vector per sample.
    pub fn run_inference(&self, batch: &ImageBatch) -> Result<Vec<Vec<f32>>> {
        self.check_batch(batch)?;
        let mut rng = SimpleRng::new(0);
        let mut scratch = self.scratch_for(&mut rng);
        let mut activations = self.forward_all(batch, &mut scratch)?;
        let mut output = activations.pop().unwrap_or_default();

        let per_sample = self.output_shape().element_count();
        if matches!(self.nodes.last().map(|n| &n.op), Some(NodeOp::Softmax)) {
            softmax_rows(&mut output, batch.len(), per_sample);
        }
        Ok(output
            .chunks_exact(per_sample.max(1))
            .map(<[f32]>::to_vec)
            .collect())
    }

    /// One full training step: forward, loss, backward, and one optimizer
    /// update per parameter store. Returns the per-sample losses.
    pub fn run_training_step(&self, batch: &ImageBatch, mut rng: SimpleRng) -> Result<Vec<f32>> {
        self.check_batch(batch)?;
        let loss = match self.nodes.last().map(|n| &n.op) {
            Some(NodeOp::Loss(loss)) => *loss,
            _ => {
                return Err(EngineError::GraphEncoding(
                    "inference graphs cannot be trained".into(),
                ))
            }
        };

        let batch_size = batch.len();
        let mut scratch = self.scratch_for(&mut rng);
        let activations = self.forward_all(batch, &mut scratch)?;
        let output = activations.last().map(Vec::as_slice).unwrap_or_default();
        let loss_output = loss.evaluate(output, &batch.flatten_targets(), batch_size)?;

        let ops: Vec<&dyn GraphOp> = self.forward_ops().collect();
        let mut updates: Vec<(&SharedParameterStore, ParameterGradient)> = Vec::new();
        let mut grad_output = loss_output.gradient.clone();
        for (i, op) in ops.iter().enumerate().rev() {
            let mut grad_input = vec![0.0f32; activations[i].len()];
            let gradient = op.backward(
                &activations[i],
                &activations[i + 1],
                &grad_output,
                &mut grad_input,
                batch_size,
                &scratch[i],
            )?;
            if let (Some(store), Some(gradient)) = (op.parameter_store(), gradient) {
                updates.push((store, gradient));
            }
            grad_output = grad_input;
        }

        for (store, gradient) in updates {
            write_store(store)?.apply_gradient(&gradient)?;
        }
        Ok(loss_output.per_sample)
    }

    /// Distinct parameter stores in node order.
    pub fn parameter_stores(&self) -> Vec<SharedParameterStore> {
        let mut stores: Vec<SharedParameterStore> = Vec::new();
        for store in self.nodes.iter().filter_map(GraphNode::parameter_store) {
            if !stores.iter().any(|s| Arc::ptr_eq(s, store)) {
                stores.push(store.clone());
            }
        }
        stores
    }
}
