//! Trains and publishes a duration model.
//!
//! ```bash
//! # Train from an exported CSV of completed tasks
//! train_model --csv data/tasks.csv
//!
//! # Train on 1000 synthetic tasks with an LSTM encoder
//! train_model --synthetic 1000 --rnn-type lstm
//!
//! # Retrain from the local task store snapshot
//! train_model --from-store
//!
//! # Score the published model on a file without publishing anything
//! train_model --json data/holdout.json --evaluate-only
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use task_duration_estimator::duration_model::RnnType;
use task_duration_estimator::estimation::LocalTaskStore;
use task_duration_estimator::model_evaluation::TrainingType;
use task_duration_estimator::training::{
    ArtifactStore, DataSource, collect_dataset, evaluate_published, retrain, run_training,
};
use task_duration_estimator::utils::{init_tracing, load_config_from};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Architecture {
    Gru,
    Lstm,
}

impl From<Architecture> for RnnType {
    fn from(architecture: Architecture) -> Self {
        match architecture {
            Architecture::Gru => RnnType::Gru,
            Architecture::Lstm => RnnType::Lstm,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "train_model", about = "Train and publish a task duration model")]
struct Args {
    /// CSV export with Spanish or snake_case headers.
    #[arg(long, group = "source")]
    csv: Option<PathBuf>,

    /// JSON array of task attributes with `actual_duration`.
    #[arg(long, group = "source")]
    json: Option<PathBuf>,

    /// Number of synthetic tasks to generate.
    #[arg(long, group = "source")]
    synthetic: Option<usize>,

    /// Retrain from the completed tasks of the configured task store.
    #[arg(long, group = "source")]
    from_store: bool,

    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Overrides `model_dir` from the config file.
    #[arg(long)]
    model_dir: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long, value_enum)]
    rnn_type: Option<Architecture>,

    /// Seed for weights, shuffling and synthetic data.
    #[arg(long)]
    seed: Option<u64>,

    /// Evaluate the published model instead of training a new one.
    #[arg(long)]
    evaluate_only: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut config = load_config_from(&args.config);
    if let Some(model_dir) = args.model_dir {
        config.model_dir = model_dir;
    }
    if let Some(epochs) = args.epochs {
        config.model.epochs = epochs;
    }
    if let Some(rnn_type) = args.rnn_type {
        config.model.rnn_type = rnn_type.into();
    }
    if let Some(seed) = args.seed {
        config.model.seed = Some(seed);
        config.training.split_seed = seed;
    }
    let artifacts = ArtifactStore::new(&config.model_dir);

    if args.from_store {
        let path = config.task_store_path.clone().context("no task_store_path configured")?;
        let store = LocalTaskStore::open(&path)?;
        let outcome = retrain(&store, &config.model, &config.training, &artifacts, &config.model_name)?;
        tracing::info!(version = outcome.artifact.version(), r2 = ?outcome.test_metrics.r2, "retrained from task store");
        return Ok(());
    }

    let source = match (args.csv, args.json, args.synthetic) {
        (Some(path), _, _) => DataSource::Csv(path),
        (_, Some(path), _) => DataSource::Json(path),
        (_, _, rows) => DataSource::Synthetic { rows: rows.unwrap_or(1000), seed: config.model.seed.unwrap_or(42) },
    };
    let min_rows = if args.evaluate_only { 1 } else { config.training.min_rows };
    let dataset = collect_dataset(source, min_rows)?;

    if args.evaluate_only {
        let metrics = evaluate_published(&dataset, &artifacts)?;
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        return Ok(());
    }

    let outcome = run_training(
        &dataset,
        &config.model,
        &config.training,
        &artifacts,
        &config.model_name,
        TrainingType::Initial,
    )?;
    println!("published version {}", outcome.artifact.version());
    println!("{}", serde_json::to_string_pretty(&outcome.test_metrics)?);
    for segment in &outcome.segments {
        match &segment.metrics {
            Some(metrics) => println!("{:<20} n={:<5} rmse={:.2} mae={:.2}", segment.name, segment.count, metrics.rmse, metrics.mae),
            None => println!("{:<20} n=0", segment.name),
        }
    }
    Ok(())
}
