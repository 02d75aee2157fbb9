//! Sequential model: compile a layer list into training and inference graphs
//! and drive them through the command queue.
//!
//! At most `max_in_flight` command units are outstanding at any time. Each
//! unit takes a gate permit before its batch is built and gives it back from
//! its completion handler, so the host prepares the next batch while the
//! backend runs the previous one.

use crate::config::TrainingConfig;
use crate::dataset::{Dataset, DatasetSampler};
use crate::device::{CommandHandle, CommandQueue, CommandState, Device, InFlightGate};
use crate::error::{EngineError, Result};
use crate::graph::{Graph, GraphKind, GraphNode, NodeHandle};
use crate::layers::loss::batch_loss;
use crate::layers::{BuildContext, LayerSpec, LossSpec};
use crate::optimizers::OptimizerKind;
use crate::parameter_store::{read_store, write_store, ParameterState, SharedParameterStore};
use crate::tensor::ImageShape;
use crate::utils::argmax;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Lifecycle of a [`Sequential`] model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unbuilt,
    Compiled,
    Training,
    Evaluating,
}

/// Loss of one completed training iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub epoch: usize,
    pub iteration: usize,
    pub loss: f32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub epochs: usize,
    pub submitted: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Loss of the last iteration to complete, if any did.
    pub final_loss: Option<f32>,
    pub peak_in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationReport {
    pub correct: usize,
    pub total: usize,
    /// Percentage of correctly classified samples.
    pub accuracy: f32,
}

#[derive(Debug, Default)]
struct Tally {
    correct: usize,
    total: usize,
}

struct CompiledModel {
    training: Arc<Graph>,
    inference: Arc<Graph>,
    stores: Vec<SharedParameterStore>,
    optimizer: OptimizerKind,
    loss: LossSpec,
}

/// A linear stack of layers trained with minibatch Adam.
///
/// # Example
///
/// ```no_run
/// use sequential_trainer::config::TrainingConfig;
/// use sequential_trainer::layers::{LayerSpec, LossSpec, Padding, PoolingMode, Reduction};
/// use sequential_trainer::optimizers::OptimizerKind;
/// use sequential_trainer::sequential::Sequential;
/// use sequential_trainer::tensor::ImageShape;
///
/// let mut model = Sequential::new(ImageShape::new(28, 28, 1), TrainingConfig::default()).unwrap();
/// model
///     .add(LayerSpec::convolution((3, 3), 1, 4, 1, Padding::Same))
///     .add(LayerSpec::relu())
///     .add(LayerSpec::pooling(PoolingMode::Max, 2, 2, Padding::Same));
/// model.compile(OptimizerKind::Adam, LossSpec::mse(Reduction::Mean)).unwrap();
/// ```
pub struct Sequential {
    input_shape: ImageShape,
    config: TrainingConfig,
    layers: Vec<LayerSpec>,
    state: ModelState,
    compiled: Option<CompiledModel>,
    sampler: DatasetSampler,
    history: Arc<Mutex<Vec<IterationRecord>>>,
    gate: Arc<InFlightGate>,
    device: Device,
    queue: CommandQueue,
}

impl Sequential {
    /// Create an empty model and bring up the compute backend.
    pub fn new(input_shape: ImageShape, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        if input_shape.element_count() == 0 {
            return Err(EngineError::config(format!(
                "input shape {} has no elements",
                input_shape
            )));
        }
        let device = Device::system_default(config.backend_workers)?;
        let queue = device.make_command_queue()?;
        let gate = InFlightGate::new(config.max_in_flight)?;
        let sampler = DatasetSampler::new(config.class_count, config.seed);

        Ok(Self {
            input_shape,
            config,
            layers: Vec::new(),
            state: ModelState::Unbuilt,
            compiled: None,
            sampler,
            history: Arc::new(Mutex::new(Vec::new())),
            gate,
            device,
            queue,
        })
    }

    pub fn with_layers(
        input_shape: ImageShape,
        config: TrainingConfig,
        layers: Vec<LayerSpec>,
    ) -> Result<Self> {
        let mut model = Self::new(input_shape, config)?;
        model.layers = layers;
        Ok(model)
    }

    /// Append a layer. Adding to a compiled model discards its graphs.
    pub fn add(&mut self, layer: LayerSpec) -> &mut Self {
        self.layers.push(layer);
        self.compiled = None;
        self.state = ModelState::Unbuilt;
        self
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn input_shape(&self) -> ImageShape {
        self.input_shape
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Build the training graph (layers + loss) and the inference graph
    /// (layers + softmax). Both graphs share one parameter store per layer.
    pub fn compile(&mut self, optimizer: OptimizerKind, loss: LossSpec) -> Result<()> {
        let (forward_layers, trailing_loss) = match self.layers.split_last() {
            None => return Err(EngineError::config("cannot compile an empty layer list")),
            Some((LayerSpec::Loss(spec), rest)) => (rest, Some(*spec)),
            Some(_) => (self.layers.as_slice(), None),
        };
        if let Some(spec) = trailing_loss {
            if spec != loss {
                return Err(EngineError::config(format!(
                    "trailing loss layer {:?} disagrees with requested loss {:?}",
                    spec, loss
                )));
            }
        }
        if forward_layers.is_empty() {
            return Err(EngineError::config("model has no layers before its loss"));
        }
        if let Some(index) = forward_layers.iter().position(LayerSpec::is_loss) {
            return Err(EngineError::config(format!(
                "layer {} is a loss; only the last layer may be",
                index
            )));
        }
        let loss_layer = LayerSpec::Loss(loss);
        loss_layer.validate()?;

        let mut ctx = BuildContext::new(self.config.hyperparameters(), self.config.seed);
        let training = build_graph(GraphKind::Training, self.input_shape, forward_layers, &loss_layer, &mut ctx)?;
        let inference = build_graph(GraphKind::Inference, self.input_shape, forward_layers, &loss_layer, &mut ctx)?;
        let stores = ctx.into_stores();

        log::info!(
            "Compiled {} layers with {:?}: {} -> {}, {} parameter stores",
            forward_layers.len(),
            optimizer,
            self.input_shape,
            inference.output_shape(),
            stores.len()
        );

        self.compiled = Some(CompiledModel {
            training: Arc::new(training),
            inference: Arc::new(inference),
            stores,
            optimizer,
            loss,
        });
        self.state = ModelState::Compiled;
        Ok(())
    }

    fn compiled(&self) -> Result<&CompiledModel> {
        self.compiled
            .as_ref()
            .ok_or_else(|| EngineError::config("model has not been compiled"))
    }

    pub fn optimizer(&self) -> Option<OptimizerKind> {
        self.compiled.as_ref().map(|c| c.optimizer)
    }

    pub fn loss(&self) -> Option<LossSpec> {
        self.compiled.as_ref().map(|c| c.loss)
    }

    pub fn training_graph(&self) -> Option<&Graph> {
        self.compiled.as_ref().map(|c| c.training.as_ref())
    }

    pub fn inference_graph(&self) -> Option<&Graph> {
        self.compiled.as_ref().map(|c| c.inference.as_ref())
    }

    /// Output shape of the inference graph.
    pub fn output_shape(&self) -> Result<ImageShape> {
        Ok(self.compiled()?.inference.output_shape())
    }

    /// Output shape of the node labelled `label`, e.g. `"Conv1"`.
    pub fn node_output_shape(&self, label: &str) -> Option<ImageShape> {
        self.inference_graph()?.node(label).map(GraphNode::output_shape)
    }

    /// Store of the layer labelled `label`.
    pub fn parameter_store(&self, label: &str) -> Option<SharedParameterStore> {
        let compiled = self.compiled.as_ref()?;
        compiled
            .stores
            .iter()
            .find(|store| read_store(store).map(|s| s.name() == label).unwrap_or(false))
            .cloned()
    }

    /// Losses of all completed training iterations, in completion order.
    pub fn history(&self) -> Vec<IterationRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.gate.peak_in_flight()
    }

    fn check_dataset(&self, dataset: &Dataset) -> Result<()> {
        if dataset.image_shape() != self.input_shape {
            return Err(EngineError::config(format!(
                "dataset images are {}, model expects {}",
                dataset.image_shape(),
                self.input_shape
            )));
        }
        Ok(())
    }

    fn check_class_count(&self, class_count: usize) -> Result<()> {
        let output = self.output_shape()?;
        if output.element_count() != class_count {
            return Err(EngineError::config(format!(
                "network output {} has {} elements, expected {} classes",
                output,
                output.element_count(),
                class_count
            )));
        }
        Ok(())
    }

    /// Run one training sample through the inference graph and report the
    /// shape it produces.
    pub fn probe_output_shape(&self, dataset: &Dataset) -> Result<ImageShape> {
        let compiled = self.compiled()?;
        self.check_dataset(dataset)?;
        let mut sampler = DatasetSampler::new(self.config.class_count, self.config.seed);
        let batch = sampler.sample_random_batch(dataset, 1)?;

        let graph = compiled.inference.clone();
        let shape = graph.output_shape();
        let mut buffer = self.queue.make_command_buffer::<Vec<Vec<f32>>>("probe");
        buffer.encode(move || graph.run_inference(&batch));
        buffer.add_completed_handler(move |result| {
            if result.is_ok() {
                log::info!(
                    "Output size: width - {}, height - {}, featureChannels - {}",
                    shape.width,
                    shape.height,
                    shape.channels
                );
            }
        });

        let handle = buffer.commit()?;
        match handle.wait_until_completed() {
            CommandState::Failed => Err(EngineError::DeviceExecution(
                handle.error().unwrap_or_default(),
            )),
            _ => Ok(shape),
        }
    }

    /// Submit one training step on a random batch.
    ///
    /// Blocks while the gate is full. Returns `Ok(None)` when the batch was
    /// skipped because it could not be built or encoded.
    pub fn train_iteration(
        &mut self,
        iteration: usize,
        total: usize,
        dataset: &Dataset,
        batch_size: usize,
    ) -> Result<Option<CommandHandle>> {
        self.submit_training_step(0, iteration, total, dataset, batch_size)
    }

    fn submit_training_step(
        &mut self,
        epoch: usize,
        iteration: usize,
        total: usize,
        dataset: &Dataset,
        batch_size: usize,
    ) -> Result<Option<CommandHandle>> {
        let graph = self.compiled()?.training.clone();
        let permit = self.gate.acquire();
        let start = Instant::now();

        let batch = match self.sampler.sample_random_batch(dataset, batch_size) {
            Ok(batch) => batch,
            Err(err) if !err.is_fatal() => {
                log::warn!("Iteration {}/{}: skipping batch: {}", iteration + 1, total, err);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if let Err(err) = graph.check_batch(&batch) {
            log::warn!("Iteration {}/{}: skipping batch: {}", iteration + 1, total, err);
            return Ok(None);
        }

        let rng = self.sampler.fork_rng(iteration as u64);
        let mut buffer = self
            .queue
            .make_command_buffer::<Vec<f32>>(format!("train-{}", iteration + 1));
        buffer.encode(move || graph.run_training_step(&batch, rng));

        let history = self.history.clone();
        buffer.add_completed_handler(move |result| {
            let elapsed = start.elapsed();
            match result {
                Ok(losses) => {
                    let loss = batch_loss(losses);
                    log::info!(
                        "Iteration {}/{}, {:.3}s, training loss = {}",
                        iteration + 1,
                        total,
                        elapsed.as_secs_f32(),
                        loss
                    );
                    history
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(IterationRecord {
                            epoch,
                            iteration,
                            loss,
                            elapsed,
                        });
                }
                Err(err) => log::error!("Iteration {}/{} failed: {}", iteration + 1, total, err),
            }
            drop(permit);
        });

        buffer.commit().map(Some)
    }

    /// Train for `epochs` epochs of `config.iterations` random minibatches.
    pub fn train(&mut self, dataset: &Dataset, epochs: usize, batch_size: usize) -> Result<TrainingReport> {
        self.compiled()?;
        if batch_size == 0 {
            return Err(EngineError::config("batch size must be positive"));
        }
        if epochs == 0 {
            return Err(EngineError::config("epoch count must be positive"));
        }
        self.check_dataset(dataset)?;
        self.check_class_count(self.config.class_count)?;

        let iterations = self.config.iterations;
        let mut report = TrainingReport {
            epochs,
            submitted: 0,
            skipped: 0,
            failed: 0,
            final_loss: None,
            peak_in_flight: 0,
        };

        self.state = ModelState::Training;
        for epoch in 0..epochs {
            log::info!("Starting epoch {}", epoch);
            let mut handles = Vec::with_capacity(iterations);
            for iteration in 0..iterations {
                match self.submit_training_step(epoch, iteration, iterations, dataset, batch_size) {
                    Ok(Some(handle)) => handles.push(handle),
                    Ok(None) => report.skipped += 1,
                    Err(err) => {
                        self.gate.wait_idle();
                        self.state = ModelState::Compiled;
                        return Err(err);
                    }
                }
            }
            for handle in &handles {
                if handle.wait_until_completed() == CommandState::Failed {
                    report.failed += 1;
                }
            }
            report.submitted += handles.len();
            self.gate.wait_idle();
        }
        self.state = ModelState::Compiled;

        report.final_loss = self.history().last().map(|r| r.loss);
        report.peak_in_flight = self.gate.peak_in_flight();
        Ok(report)
    }

    /// Classify the whole test partition and report accuracy.
    pub fn evaluate(&mut self, dataset: &Dataset, class_count: usize) -> Result<EvaluationReport> {
        let graph = self.compiled()?.inference.clone();
        self.check_dataset(dataset)?;
        self.check_class_count(class_count)?;

        let batch_size = self.config.batch_size;
        let records = dataset.test().len();
        let tally = Arc::new(Mutex::new(Tally::default()));
        let mut sampler = DatasetSampler::new(class_count, self.config.seed);
        let mut handles = Vec::new();

        self.state = ModelState::Evaluating;
        let mut start = 0;
        while start < records {
            let permit = self.gate.acquire();
            let batch = match sampler.sequential_batch(dataset, start, batch_size) {
                Ok(batch) => batch,
                Err(err) if !err.is_fatal() => {
                    log::warn!("Skipping test records {}..{}: {}", start, start + batch_size, err);
                    start += batch_size;
                    continue;
                }
                Err(err) => {
                    drop(permit);
                    self.gate.wait_idle();
                    self.state = ModelState::Compiled;
                    return Err(err);
                }
            };
            start += batch_size;
            if batch.is_empty() {
                continue;
            }

            let labels = batch.labels().to_vec();
            let graph = graph.clone();
            let mut buffer = self
                .queue
                .make_command_buffer::<Vec<Vec<f32>>>(format!("eval-{}", handles.len() + 1));
            buffer.encode(move || graph.run_inference(&batch));

            let tally = tally.clone();
            buffer.add_completed_handler(move |result| {
                match result {
                    Ok(outputs) => {
                        let mut tally = tally.lock().unwrap_or_else(PoisonError::into_inner);
                        for (output, &label) in outputs.iter().zip(&labels) {
                            if argmax(output) == Some(label as usize) {
                                tally.correct += 1;
                            }
                            tally.total += 1;
                        }
                    }
                    Err(err) => log::error!("Evaluation batch failed: {}", err),
                }
                drop(permit);
            });

            match buffer.commit() {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    self.gate.wait_idle();
                    self.state = ModelState::Compiled;
                    return Err(err);
                }
            }
        }

        for handle in &handles {
            handle.wait_until_completed();
        }
        self.gate.wait_idle();
        self.state = ModelState::Compiled;

        let tally = tally.lock().unwrap_or_else(PoisonError::into_inner);
        let accuracy = if tally.total == 0 {
            0.0
        } else {
            100.0 * tally.correct as f32 / tally.total as f32
        };
        log::info!("Test Set Accuracy = {:.2} %", accuracy);
        Ok(EvaluationReport {
            correct: tally.correct,
            total: tally.total,
            accuracy,
        })
    }

    /// Train on `train_set` with the configured schedule, then evaluate on
    /// `evaluation_set`.
    pub fn train_and_evaluate(
        &mut self,
        train_set: &Dataset,
        evaluation_set: &Dataset,
    ) -> Result<(TrainingReport, EvaluationReport)> {
        let training = self.train(train_set, self.config.epochs, self.config.batch_size)?;
        let evaluation = self.evaluate(evaluation_set, self.config.class_count)?;
        Ok((training, evaluation))
    }

    /// Serialize every parameter store, in layer order.
    pub fn export_parameters(&self) -> Result<Vec<u8>> {
        let compiled = self.compiled()?;
        self.gate.wait_idle();
        let states = compiled
            .stores
            .iter()
            .map(|store| read_store(store).map(|s| s.state().clone()))
            .collect::<Result<Vec<ParameterState>>>()?;
        Ok(bincode::serialize(&states)?)
    }

    /// Load parameter sets produced by [`export_parameters`](Self::export_parameters),
    /// matching them to stores by label.
    pub fn import_parameters(&self, bytes: &[u8]) -> Result<()> {
        let states: Vec<ParameterState> = bincode::deserialize(bytes)?;
        self.load_parameters(states)
    }

    pub fn load_parameters(&self, states: Vec<ParameterState>) -> Result<()> {
        self.compiled()?;
        self.gate.wait_idle();
        for state in states {
            let store = self.parameter_store(&state.name).ok_or_else(|| {
                EngineError::config(format!("no layer labelled {}", state.name))
            })?;
            write_store(&store)?.load_state(state)?;
        }
        Ok(())
    }
}

fn build_graph(
    kind: GraphKind,
    input_shape: ImageShape,
    layers: &[LayerSpec],
    loss: &LayerSpec,
    ctx: &mut BuildContext,
) -> Result<Graph> {
    ctx.begin_graph(kind);
    let mut handle = NodeHandle::input(input_shape);
    let mut nodes = Vec::with_capacity(layers.len() + 1);
    for (index, layer) in layers.iter().enumerate() {
        ctx.enter_layer(index);
        let node = layer.instantiate(&handle, ctx)?;
        handle = node.handle();
        nodes.push(node);
    }

    match kind {
        GraphKind::Training => {
            ctx.enter_layer(layers.len());
            nodes.push(loss.instantiate(&handle, ctx)?);
        }
        GraphKind::Inference => nodes.push(GraphNode::softmax(handle.shape)),
    }
    Graph::new(kind, input_shape, nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Padding, PoolingMode, Reduction};

    fn model(layers: Vec<LayerSpec>) -> Sequential {
        Sequential::with_layers(ImageShape::new(28, 28, 1), TrainingConfig::default(), layers)
            .unwrap()
    }

    #[test]
    fn test_compile_shapes() {
        let mut m = model(vec![
            LayerSpec::convolution((3, 3), 1, 4, 1, Padding::Same),
            LayerSpec::relu(),
            LayerSpec::pooling(PoolingMode::Max, 2, 2, Padding::Same),
            LayerSpec::mse(Reduction::Mean),
        ]);
        m.compile(OptimizerKind::Adam, LossSpec::mse(Reduction::Mean))
            .unwrap();

        assert_eq!(m.state(), ModelState::Compiled);
        assert_eq!(m.node_output_shape("Conv1"), Some(ImageShape::new(28, 28, 4)));
        assert_eq!(m.output_shape().unwrap(), ImageShape::new(14, 14, 4));
        assert_eq!(
            m.training_graph().unwrap().node_labels(),
            vec!["Conv1", "ReLU1", "Pool1", "Loss1"]
        );
        assert_eq!(
            m.inference_graph().unwrap().node_labels(),
            vec!["Conv1", "ReLU1", "Pool1", "Softmax"]
        );
    }

    #[test]
    fn test_graphs_share_stores() {
        let mut m = model(vec![LayerSpec::convolution((3, 3), 1, 2, 1, Padding::Same)]);
        m.compile(OptimizerKind::Adam, LossSpec::mse(Reduction::Mean))
            .unwrap();
        let training = m.training_graph().unwrap().parameter_stores();
        let inference = m.inference_graph().unwrap().parameter_stores();
        assert_eq!(training.len(), 1);
        assert!(Arc::ptr_eq(&training[0], &inference[0]));
        assert!(m.parameter_store("Conv1").is_some());
    }

    #[test]
    fn test_empty_model_rejected() {
        let mut m = model(vec![]);
        let err = m
            .compile(OptimizerKind::Adam, LossSpec::mse(Reduction::Mean))
            .unwrap_err();
        assert!(err.is_fatal());

        let mut only_loss = model(vec![LayerSpec::mse(Reduction::Mean)]);
        assert!(only_loss
            .compile(OptimizerKind::Adam, LossSpec::mse(Reduction::Mean))
            .is_err());
    }

    #[test]
    fn test_loss_must_be_last() {
        let mut m = model(vec![
            LayerSpec::mse(Reduction::Mean),
            LayerSpec::relu(),
        ]);
        assert!(m
            .compile(OptimizerKind::Adam, LossSpec::mse(Reduction::Mean))
            .is_err());
    }

    #[test]
    fn test_mismatched_loss_rejected() {
        let mut m = model(vec![LayerSpec::relu(), LayerSpec::mse(Reduction::Sum)]);
        assert!(m
            .compile(OptimizerKind::Adam, LossSpec::mse(Reduction::Mean))
            .is_err());
    }

    #[test]
    fn test_shape_incompatibility_rejected() {
        let mut m = model(vec![LayerSpec::dense(784, 10)]);
        assert!(m
            .compile(OptimizerKind::Adam, LossSpec::mse(Reduction::Mean))
            .is_err());
        assert_eq!(m.state(), ModelState::Unbuilt);
    }
}
