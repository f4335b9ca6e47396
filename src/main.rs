use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use gensen_train::{GenSenConfig, logging, train};

/// Multitask GenSen sentence-encoder training.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON run configuration
    #[arg(long)]
    config: PathBuf,
    /// Folder that relative paths in the configuration are taken from
    #[arg(long)]
    data_folder: PathBuf,
    /// Per-worker learning rate; `training.lrate` when absent
    #[arg(long)]
    learning_rate: Option<f64>,
}

#[cfg(not(feature = "cuda"))]
mod backend {
    use burn::backend::{Autodiff, NdArray, ndarray::NdArrayDevice};

    pub type MyAutodiffBackend = Autodiff<NdArray<f32>>;

    pub fn devices(n: usize) -> Vec<NdArrayDevice> {
        vec![NdArrayDevice::Cpu; n]
    }
}

#[cfg(feature = "cuda")]
mod backend {
    use burn::backend::{Autodiff, Cuda, cuda::CudaDevice};

    pub type MyAutodiffBackend = Autodiff<Cuda<f32, i32>>;

    pub fn devices(n: usize) -> Vec<CudaDevice> {
        (0..n).map(CudaDevice::new).collect()
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = GenSenConfig::from_file(&args.config)?;
    let paths = config.resolve_paths(&args.data_folder);

    logging::init(&paths.log_file)
        .with_context(|| format!("Could not open log file {}", paths.log_file.display()))?;

    let devices = backend::devices(config.training.n_gpus);
    let ctx = train::prepare(config, &args.data_folder, args.learning_rate)?;

    let outcome = train::launch::<backend::MyAutodiffBackend>(&ctx, devices)?;

    if let Some(path) = outcome.checkpoint {
        log::info!(
            "Best validation loss {:.5} at monitoring round {}, model in {}",
            outcome.min_val_loss,
            outcome.min_val_loss_epoch,
            path.display()
        );
    }

    Ok(())
}
