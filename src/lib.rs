//! Sequential neural network training engine
//!
//! Builds paired training and inference graphs from a list of layer
//! specifications, trains them with minibatch Adam while keeping a bounded
//! number of command units in flight, and evaluates classification accuracy.
//!
//! # Modules
//!
//! - `tensor`: Image shapes, feature maps and minibatches
//! - `parameter_store`: Per-layer weights with Adam state, save/restore
//! - `layers`: Layer specifications and the graph ops they build
//! - `graph`: Compiled training and inference graphs
//! - `device`: Command queue, worker threads and the in-flight gate
//! - `sequential`: The model: compile, train, evaluate
//! - `dataset`: Raw image/label buffers and minibatch sampling
//! - `optimizers`: Optimizer trait and the Adam kernel
//! - `utils`: Shared utilities (RNG, activation functions)
//! - `config`: Training configuration
//! - `architecture`: JSON architecture files and model building
//! - `error`: Error type shared by all modules

pub mod architecture;
pub mod config;
pub mod dataset;
pub mod device;
pub mod error;
pub mod graph;
pub mod layers;
pub mod optimizers;
pub mod parameter_store;
pub mod sequential;
pub mod tensor;
pub mod utils;

pub use config::TrainingConfig;
pub use dataset::{Dataset, DatasetLayout, DatasetSampler};
pub use error::{EngineError, Result};
pub use layers::{LayerSpec, LossSpec, Padding, PoolingMode, Reduction};
pub use optimizers::OptimizerKind;
pub use parameter_store::{KernelShape, ParameterStore};
pub use sequential::{EvaluationReport, Sequential, TrainingReport};
pub use tensor::{ImageBatch, ImageShape, TensorImage};
