//! Estimates every task of a CSV file with the published model.
//!
//! ```bash
//! predict --input-file data/pending.csv --output-file predictions.csv
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use task_duration_estimator::estimation::{EstimationContext, predict_csv};
use task_duration_estimator::training::ArtifactStore;
use task_duration_estimator::utils::{init_tracing, load_config_from};

#[derive(Debug, Parser)]
#[command(name = "predict", about = "Estimate the tasks of a CSV file")]
struct Args {
    /// Tasks with the training headers; the duration column is optional.
    #[arg(long)]
    input_file: PathBuf,

    #[arg(long, default_value = "predictions.csv")]
    output_file: PathBuf,

    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Overrides `model_dir` from the config file.
    #[arg(long)]
    model_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_config_from(&args.config);
    let model_dir = args.model_dir.unwrap_or(config.model_dir);
    let context = EstimationContext::new(ArtifactStore::new(&model_dir), config.model_name);

    let summary = predict_csv(&context, &args.input_file, &args.output_file)?;
    println!("predictions saved to {} (model {})", args.output_file.display(), summary.model_version);
    println!("estimated {} tasks, skipped {}", summary.predicted, summary.skipped);
    println!("mean   {:.2} h", summary.mean);
    println!("median {:.2} h", summary.median);
    println!("min    {:.2} h", summary.min);
    println!("max    {:.2} h", summary.max);
    Ok(())
}
