// mnist_sequential.rs
// Small CNN classifier for MNIST built from layer specifications and trained
// through the sequential engine.
// Expected files:
//   ./data/train-images.idx3-ubyte
//   ./data/train-labels.idx1-ubyte
//   ./data/t10k-images.idx3-ubyte
//   ./data/t10k-labels.idx1-ubyte
//
// Usage:
//   mnist_sequential [training-config.json]
//
// Output:
//   - per-iteration training loss and the test accuracy, through the logger
//   - ./logs/mnist_sequential.params (trained parameters)

use sequential_trainer::config::{load_config, TrainingConfig};
use sequential_trainer::dataset::{Dataset, DatasetLayout};
use sequential_trainer::layers::{LayerSpec, LossSpec, Padding, PoolingMode, Reduction};
use sequential_trainer::optimizers::OptimizerKind;
use sequential_trainer::sequential::Sequential;
use sequential_trainer::Result;
use std::fs;
use std::process;

const CONV_OUT: usize = 8;
const POOL_OUT: usize = 14;
const FC_IN: usize = CONV_OUT * POOL_OUT * POOL_OUT; // 1568

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|err| {
        log::error!("Could not open file {}", path);
        err.into()
    })
}

fn load_mnist() -> Result<Dataset> {
    Dataset::new(
        read_file("./data/train-images.idx3-ubyte")?,
        read_file("./data/train-labels.idx1-ubyte")?,
        read_file("./data/t10k-images.idx3-ubyte")?,
        read_file("./data/t10k-labels.idx1-ubyte")?,
        DatasetLayout::mnist(),
    )
}

fn classifier(class_count: usize) -> Vec<LayerSpec> {
    vec![
        LayerSpec::convolution((3, 3), 1, CONV_OUT, 1, Padding::Same),
        LayerSpec::relu(),
        LayerSpec::pooling(PoolingMode::Max, 2, 2, Padding::Same),
        LayerSpec::flatten(FC_IN),
        LayerSpec::dense(FC_IN, class_count),
        LayerSpec::sigmoid(),
        LayerSpec::mse(Reduction::Mean),
    ]
}

fn config_from_args(args: &[String]) -> Result<TrainingConfig> {
    match args.get(1) {
        Some(path) => load_config(path),
        None => Ok(TrainingConfig::default()),
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = config_from_args(&args)?;

    log::info!("Loading MNIST...");
    let dataset = load_mnist()?;
    log::info!(
        "Train: {} | Test: {}",
        dataset.train().len(),
        dataset.test().len()
    );

    let mut model = Sequential::with_layers(
        dataset.image_shape(),
        config.clone(),
        classifier(config.class_count),
    )?;
    model.compile(OptimizerKind::Adam, LossSpec::mse(Reduction::Mean))?;
    model.probe_output_shape(&dataset)?;

    log::info!(
        "Training: epochs={} iterations={} batch={} lr={}",
        config.epochs,
        config.iterations,
        config.batch_size,
        config.learning_rate
    );
    let (training, evaluation) = model.train_and_evaluate(&dataset, &dataset)?;
    log::info!(
        "Submitted {} iterations ({} skipped, {} failed), final loss {:?}",
        training.submitted,
        training.skipped,
        training.failed,
        training.final_loss
    );
    log::info!(
        "Correct: {} / {} ({:.2}%)",
        evaluation.correct,
        evaluation.total,
        evaluation.accuracy
    );

    fs::create_dir_all("./logs")?;
    fs::write("./logs/mnist_sequential.params", model.export_parameters()?)?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt().init();

    if let Err(err) = run() {
        eprintln!("{}", err);
        process::exit(1);
    }
}
