#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{NdArray, Wgpu};
use burn::prelude::*;
use clap::{Parser, ValueEnum};
use coral_burn::config::ExperimentConfig;
use coral_burn::data::load_experiment_data;
use coral_burn::training::{
    checkpoint_path, evaluate_target, load_model, EvaluationSummary, TrainingState,
};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendKind {
    Ndarray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(about = "Report target-domain accuracy of a saved model")]
struct Args {
    /// Run directory written by `train` (holds `config.json` and `model`).
    #[arg(long)]
    run_dir: PathBuf,
    /// Directory that relative data roots resolve against; defaults to the run's parent.
    #[arg(long)]
    experiment_dir: Option<PathBuf>,
    /// Load the best-target checkpoint named in `state.json` instead of the final model.
    #[arg(long, default_value_t = false)]
    best: bool,
    #[arg(long, value_enum, default_value_t = BackendKind::Ndarray)]
    backend: BackendKind,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_path = args.run_dir.join("config.json");
    let config = ExperimentConfig::from_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let experiment_dir = args
        .experiment_dir
        .clone()
        .or_else(|| args.run_dir.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let weights = if args.best {
        let state = TrainingState::load(&args.run_dir).context("failed to read state.json")?;
        let epoch = state
            .best_epoch
            .context("state.json records no best-target checkpoint")?;
        checkpoint_path(&args.run_dir, epoch)
    } else {
        args.run_dir.join("model")
    };

    let summary = match args.backend {
        BackendKind::Ndarray => {
            evaluate::<NdArray>(&config, &experiment_dir, &weights, NdArrayDevice::default())
        }
        BackendKind::Wgpu => {
            evaluate::<Wgpu>(&config, &experiment_dir, &weights, WgpuDevice::default())
        }
    }?;

    println!(
        "{}: target accuracy {:.4}, loss {:.4} over {} samples",
        config.run_signature(),
        summary.accuracy,
        summary.loss,
        summary.samples
    );
    Ok(())
}

fn evaluate<B: Backend>(
    config: &ExperimentConfig,
    experiment_dir: &Path,
    weights: &Path,
    device: B::Device,
) -> Result<EvaluationSummary> {
    let data = load_experiment_data(config, experiment_dir)
        .context("failed to index the target domain")?;
    let model = load_model::<B>(
        &config.model_config(),
        config.effective_lambda(),
        weights,
        &device,
    )
    .with_context(|| format!("failed to load weights from {}", weights.display()))?;
    Ok(evaluate_target(&model, &data.target_loader::<B>(&device)))
}
