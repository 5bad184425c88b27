use anyhow::{Context, Result};
use clap::Parser;
use coral_burn::config::ExperimentConfig;
use coral_burn::data::load_experiment_data;
use coral_burn::data::pairing::Repetition;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Index a domain pair and print pairing statistics without training")]
struct Args {
    #[arg(long)]
    experiment_dir: PathBuf,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Number of epochs to pair.
    #[arg(long, default_value_t = 2)]
    epochs: usize,
    /// Print the first N pairs of every epoch.
    #[arg(long, default_value_t = 0)]
    show: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = ExperimentConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    let data = load_experiment_data(&config, &args.experiment_dir)
        .context("failed to index the domain pair")?;
    let builder = data.builder();

    println!("combination: {}", config.combination);
    for (name, corpus) in [("source", builder.source()), ("target", builder.target())] {
        println!(
            "{name}: {} samples, {} classes at {}",
            corpus.len(),
            corpus.num_classes(),
            corpus.root.display()
        );
    }
    let repeated = match builder.repetition() {
        Repetition::Source => "source",
        Repetition::Target => "target",
    };
    println!(
        "repetition: {repeated} (factor {}), {} pairs per epoch, {} batches of {}",
        builder.repetition_factor(),
        builder.pairs_per_epoch(),
        data.train_batches(),
        config.batch_size
    );
    println!(
        "target stream: {} samples, {} batches, {} held out for custom evaluation",
        builder.target().len(),
        data.target_batches(),
        builder.validation_slice(config.validation_split).len()
    );

    for epoch in 0..args.epochs {
        let pairs = builder.epoch(epoch);
        let mut occurrences: HashMap<usize, usize> = HashMap::new();
        for pair in &pairs {
            let index = match builder.repetition() {
                Repetition::Source => pair.source_index,
                Repetition::Target => pair.target_index,
            };
            *occurrences.entry(index).or_default() += 1;
        }
        let min = occurrences.values().min().copied().unwrap_or(0);
        let max = occurrences.values().max().copied().unwrap_or(0);
        println!(
            "epoch {}: {} pairs, repeated samples used {min}..={max} times",
            epoch + 1,
            pairs.len()
        );
        for pair in pairs.iter().take(args.show) {
            println!(
                "  [{}] {} -> {}",
                pair.label,
                pair.source.display(),
                pair.target.display()
            );
        }
    }
    Ok(())
}
