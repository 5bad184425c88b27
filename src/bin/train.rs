#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, NdArray, Wgpu};
use clap::{Parser, ValueEnum};
use coral_burn::config::ExperimentConfig;
use coral_burn::training::{run, RunReport};
use std::fs::File;
use std::path::PathBuf;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendKind {
    Ndarray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(about = "Train a dual-branch network with CORAL domain alignment")]
struct Args {
    /// Directory that relative data roots resolve against and that receives the run directory.
    #[arg(long)]
    experiment_dir: PathBuf,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long, value_enum, default_value_t = BackendKind::Ndarray)]
    backend: BackendKind,
    /// Override the configured epoch count.
    #[arg(long)]
    epochs: Option<usize>,
    /// Save the final model even if the config does not ask for it.
    #[arg(long, default_value_t = false)]
    save_model: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = ExperimentConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    config.save_model |= args.save_model;

    let report = match args.backend {
        BackendKind::Ndarray => run::<Autodiff<NdArray>>(
            config,
            &args.experiment_dir,
            NdArrayDevice::default(),
        ),
        BackendKind::Wgpu => {
            run::<Autodiff<Wgpu>>(config, &args.experiment_dir, WgpuDevice::default())
        }
    }
    .context("training run failed")?;

    write_report(&report)?;
    info!(
        run = %report.run_dir.display(),
        target_accuracy = report.target.accuracy,
        target_loss = report.target.loss,
        "run complete"
    );
    Ok(())
}

fn write_report(report: &RunReport) -> Result<()> {
    let path = report.run_dir.join("report.json");
    let file = File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
