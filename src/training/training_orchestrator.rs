use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::duration_model::{ModelConfig, RnnEstimator, TrainingHistory};
use crate::errors::TrainingError;
use crate::estimation::task_store::{ModelRecord, TaskStore};
use crate::feature_encoding::{FeatureEncoder, TaskFeatures, UnknownCategoryPolicy};
use crate::model_evaluation::{
    Metrics, MetricsHistoryEntry, SegmentReport, TrainingType, default_size_segments, evaluate,
    permutation_importance, segmented_evaluation,
};
use crate::training::artifact_store::{ArtifactMetadata, ArtifactStore, TrainedArtifact};
use crate::training::data_split::stratified_split;
use crate::training::dataset::{DataSource, Dataset, LabeledTask, collect_dataset};

fn default_min_rows() -> usize {
    10
}
fn default_fraction() -> f64 {
    0.15
}
fn default_split_seed() -> u64 {
    42
}
fn default_importance_repeats() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_min_rows")]
    pub min_rows: usize,
    #[serde(default = "default_fraction")]
    pub validation_fraction: f64,
    #[serde(default = "default_fraction")]
    pub test_fraction: f64,
    #[serde(default = "default_split_seed")]
    pub split_seed: u64,
    #[serde(default)]
    pub unknown_policy: UnknownCategoryPolicy,
    /// Permutation-importance repeats on the test split; 0 skips it.
    #[serde(default = "default_importance_repeats")]
    pub importance_repeats: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            min_rows: default_min_rows(),
            validation_fraction: default_fraction(),
            test_fraction: default_fraction(),
            split_seed: default_split_seed(),
            unknown_policy: UnknownCategoryPolicy::default(),
            importance_repeats: default_importance_repeats(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub artifact: Arc<TrainedArtifact>,
    pub history: TrainingHistory,
    pub test_metrics: Metrics,
    pub segments: Vec<SegmentReport>,
    pub history_entries: usize,
}

fn split_columns(rows: &[LabeledTask]) -> (Vec<TaskFeatures>, Vec<f64>) {
    rows.iter().map(|r| (r.features.clone(), r.actual_duration)).unzip()
}

/// Trains, evaluates and publishes a new version.
///
/// The version directory is written first, then the metrics history is
/// extended, then `CURRENT` is moved. An insufficient dataset writes nothing.
pub fn run_training(
    dataset: &Dataset,
    model_config: &ModelConfig,
    training_config: &TrainingConfig,
    artifacts: &ArtifactStore,
    model_name: &str,
    training_type: TrainingType,
) -> Result<TrainingOutcome, TrainingError> {
    if dataset.len() < training_config.min_rows {
        return Err(TrainingError::InsufficientData { found: dataset.len(), required: training_config.min_rows });
    }
    model_config.validate()?;

    let split = stratified_split(
        dataset.tasks(),
        training_config.validation_fraction,
        training_config.test_fraction,
        training_config.split_seed,
    )?;
    let (train_features, train_targets) = split_columns(&split.train);
    let (validation_features, validation_targets) = split_columns(&split.validation);
    let (test_features, test_targets) = split_columns(&split.test);

    let encoder = FeatureEncoder::fit(&train_features, training_config.unknown_policy)?;
    let x_train = encoder.transform_batch(&train_features)?;
    let x_validation = encoder.transform_batch(&validation_features)?;
    let x_test = encoder.transform_batch(&test_features)?;

    tracing::info!(
        train = split.train.len(),
        validation = split.validation.len(),
        test = split.test.len(),
        ?training_type,
        "training started"
    );
    let mut model = RnnEstimator::build(encoder.schema(), model_config.clone())?;
    let history = model.train(&x_train, &train_targets, Some((&x_validation, &validation_targets)))?;

    let test_metrics = evaluate(&model, &x_test, &test_targets)?;
    let segments = segmented_evaluation(&model, &x_test, &test_targets, &default_size_segments())?;
    let feature_importance = if training_config.importance_repeats > 0 {
        permutation_importance(&model, &x_test, &test_targets, training_config.importance_repeats, training_config.split_seed)?
    } else {
        Vec::new()
    };

    let mut stats = dataset.stats();
    stats.train_rows = split.train.len();
    stats.validation_rows = split.validation.len();
    stats.test_rows = split.test.len();

    let version = artifacts.new_version_id();
    let metadata = ArtifactMetadata {
        model_name: model_name.to_string(),
        created_at: Utc::now(),
        training_type,
        model_config: model_config.clone(),
        dataset: stats.clone(),
        epochs_trained: history.epochs_trained(),
        stop_reason: history.stop_reason,
        test_metrics: test_metrics.clone(),
        segments: segments.clone(),
        feature_importance,
        history: history.clone(),
    };
    let artifact = TrainedArtifact::new(version.clone(), model, encoder, metadata)?;
    artifacts.write_version(&artifact)?;

    let history_entries = artifacts.history().append(MetricsHistoryEntry {
        timestamp: Utc::now(),
        training_type,
        model_version: version.clone(),
        metrics: test_metrics.clone(),
        dataset: stats,
        model_config: model_config.clone(),
        epochs_trained: history.epochs_trained(),
    })?;
    artifacts.promote(&version)?;

    tracing::info!(
        %version,
        epochs = history.epochs_trained(),
        test_rmse = test_metrics.rmse,
        test_r2 = ?test_metrics.r2,
        "training finished"
    );
    Ok(TrainingOutcome { artifact: Arc::new(artifact), history, test_metrics, segments, history_entries })
}

/// Retrains from the completed tasks in `store` and records the new version
/// there.
pub fn retrain(
    store: &dyn TaskStore,
    model_config: &ModelConfig,
    training_config: &TrainingConfig,
    artifacts: &ArtifactStore,
    model_name: &str,
) -> Result<TrainingOutcome, TrainingError> {
    let dataset = collect_dataset(DataSource::TaskStore(store), training_config.min_rows)?;
    let outcome =
        run_training(&dataset, model_config, training_config, artifacts, model_name, TrainingType::Retraining)?;
    store.record_model(ModelRecord {
        name: model_name.to_string(),
        version: outcome.artifact.version().to_string(),
        description: format!(
            "{:?} recurrent estimator retrained on {} completed tasks",
            model_config.rnn_type,
            dataset.len()
        ),
        precision: outcome.test_metrics.r2.unwrap_or(0.0),
        recorded_at: Utc::now(),
    })?;
    Ok(outcome)
}

/// Scores the published version on `dataset` and logs it to the history
/// without publishing anything.
pub fn evaluate_published(dataset: &Dataset, artifacts: &ArtifactStore) -> Result<Metrics, TrainingError> {
    if dataset.is_empty() {
        return Err(TrainingError::InsufficientData { found: 0, required: 1 });
    }
    let artifact = artifacts.load_current()?;
    let x = artifact.encoder().transform_batch(&dataset.features())?;
    let metrics = evaluate(artifact.model(), &x, &dataset.targets())?;
    artifacts.history().append(MetricsHistoryEntry {
        timestamp: Utc::now(),
        training_type: TrainingType::Evaluation,
        model_version: artifact.version().to_string(),
        metrics: metrics.clone(),
        dataset: dataset.stats(),
        model_config: artifact.model().config().clone(),
        epochs_trained: artifact.metadata().epochs_trained,
    })?;
    Ok(metrics)
}
