use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration_model::{ModelConfig, RnnEstimator, StopReason, TrainingHistory};
use crate::errors::{ArtifactLoadError, EncodingError, EstimationError, PersistenceError};
use crate::feature_encoding::feature_encoder::{load_schema, save_schema};
use crate::feature_encoding::{FeatureEncoder, TaskFeatures};
use crate::model_evaluation::{FeatureImportance, Metrics, MetricsHistory, SegmentReport, TrainingType};
use crate::training::dataset::DatasetStats;
use crate::utils::{read_json, write_json_atomic, write_text_atomic};

const CURRENT_POINTER: &str = "CURRENT";
const VERSIONS_DIR: &str = "versions";
const HISTORY_FILE: &str = "metrics_history.json";
const MODEL_FILE: &str = "model.json";
const ENCODER_FILE: &str = "encoder.json";
const FEATURE_DIMS_FILE: &str = "feature_dims.json";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub model_name: String,
    pub created_at: DateTime<Utc>,
    pub training_type: TrainingType,
    pub model_config: ModelConfig,
    pub dataset: DatasetStats,
    pub epochs_trained: usize,
    pub stop_reason: StopReason,
    pub test_metrics: Metrics,
    #[serde(default)]
    pub segments: Vec<SegmentReport>,
    #[serde(default)]
    pub feature_importance: Vec<FeatureImportance>,
    pub history: TrainingHistory,
}

/// A published model version: weights, the encoder it was trained with and
/// the run's metadata. Immutable once built.
#[derive(Debug, Clone)]
pub struct TrainedArtifact {
    version: String,
    model: RnnEstimator,
    encoder: FeatureEncoder,
    metadata: ArtifactMetadata,
}

impl TrainedArtifact {
    /// Fails when the encoder and model disagree on the feature layout.
    pub fn new(
        version: impl Into<String>,
        model: RnnEstimator,
        encoder: FeatureEncoder,
        metadata: ArtifactMetadata,
    ) -> Result<Self, EncodingError> {
        model.schema().ensure_matches(&encoder.schema())?;
        Ok(TrainedArtifact { version: version.into(), model, encoder, metadata })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn model(&self) -> &RnnEstimator {
        &self.model
    }

    pub fn encoder(&self) -> &FeatureEncoder {
        &self.encoder
    }

    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }

    /// Confidence reported with each estimate, from the test R².
    pub fn confidence(&self) -> f64 {
        self.metadata.test_metrics.confidence()
    }

    pub fn estimate_hours(&self, features: &TaskFeatures) -> Result<f64, EstimationError> {
        let encoded = self.encoder.transform(features)?;
        Ok(self.model.predict(&encoded)?)
    }
}

/// On-disk layout of published versions under one model directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ArtifactStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history(&self) -> MetricsHistory {
        MetricsHistory::new(self.root.join(HISTORY_FILE))
    }

    fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.versions_dir().join(version)
    }

    /// A timestamp id, suffixed when that directory is already taken.
    pub fn new_version_id(&self) -> String {
        let base = Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string();
        let mut candidate = base.clone();
        let mut suffix = 1;
        while self.version_dir(&candidate).exists() {
            candidate = format!("{base}-{suffix}");
            suffix += 1;
        }
        candidate
    }

    /// Writes every artifact file into a staging directory, then renames it
    /// into `versions/<version>`. A failed write never leaves a partial version.
    pub fn write_version(&self, artifact: &TrainedArtifact) -> Result<PathBuf, PersistenceError> {
        let versions = self.versions_dir();
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PersistenceError::Io { path, source }
        };
        fs::create_dir_all(&versions).map_err(io_err(&versions))?;

        let staging = versions.join(format!(".staging-{}", artifact.version));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(io_err(&staging))?;
        }
        fs::create_dir_all(&staging).map_err(io_err(&staging))?;

        let written = artifact
            .model
            .save(&staging.join(MODEL_FILE))
            .and_then(|_| artifact.encoder.save(&staging.join(ENCODER_FILE)))
            .and_then(|_| save_schema(&staging.join(FEATURE_DIMS_FILE), &artifact.encoder.schema()))
            .and_then(|_| write_json_atomic(&staging.join(METADATA_FILE), &artifact.metadata));
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let target = self.version_dir(&artifact.version);
        fs::rename(&staging, &target).map_err(io_err(&target))?;
        tracing::info!(version = %artifact.version, path = %target.display(), "artifact written");
        Ok(target)
    }

    /// Points `CURRENT` at an already written version.
    pub fn promote(&self, version: &str) -> Result<(), PersistenceError> {
        let dir = self.version_dir(version);
        if !dir.is_dir() {
            return Err(PersistenceError::Io {
                path: dir,
                source: std::io::Error::new(ErrorKind::NotFound, "version directory does not exist"),
            });
        }
        write_text_atomic(&self.root.join(CURRENT_POINTER), version)?;
        tracing::info!(version, "artifact promoted");
        Ok(())
    }

    pub fn current_version(&self) -> Result<Option<String>, ArtifactLoadError> {
        let path = self.root.join(CURRENT_POINTER);
        match fs::read_to_string(&path) {
            Ok(content) => {
                let version = content.trim();
                Ok((!version.is_empty()).then(|| version.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ArtifactLoadError::Io { path, source }),
        }
    }

    /// Published versions, oldest first. Staging directories are skipped.
    pub fn list_versions(&self) -> Result<Vec<String>, ArtifactLoadError> {
        let dir = self.versions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(ArtifactLoadError::Io { path: dir, source }),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ArtifactLoadError::Io { path: dir.clone(), source })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && entry.path().is_dir() {
                versions.push(name);
            }
        }
        versions.sort();
        Ok(versions)
    }

    pub fn load_version(&self, version: &str) -> Result<TrainedArtifact, ArtifactLoadError> {
        let dir = self.version_dir(version);
        if !dir.is_dir() {
            return Err(ArtifactLoadError::Missing { path: dir });
        }
        let model = RnnEstimator::load(&dir.join(MODEL_FILE))?;
        let encoder = FeatureEncoder::load(&dir.join(ENCODER_FILE))?;
        let feature_dims = load_schema(&dir.join(FEATURE_DIMS_FILE))?;
        let metadata: ArtifactMetadata = read_json(&dir.join(METADATA_FILE))?;

        let incompatible = |source| ArtifactLoadError::Incompatible { version: version.to_string(), source };
        feature_dims.ensure_matches(&encoder.schema()).map_err(incompatible)?;
        TrainedArtifact::new(version, model, encoder, metadata).map_err(incompatible)
    }

    pub fn load_current(&self) -> Result<TrainedArtifact, ArtifactLoadError> {
        match self.current_version()? {
            Some(version) => self.load_version(&version),
            None => Err(ArtifactLoadError::NothingPublished { dir: self.root.clone() }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::duration_model::ModelConfig;
    use crate::feature_encoding::UnknownCategoryPolicy;
    use crate::training::synthetic_data;

    /// A small trained artifact over synthetic rows.
    pub(crate) fn tiny_artifact(version: &str) -> TrainedArtifact {
        let rows = synthetic_data::generate(24, 5);
        let features: Vec<TaskFeatures> = rows.iter().map(|r| r.features.clone()).collect();
        let targets: Vec<f64> = rows.iter().map(|r| r.actual_duration).collect();
        let encoder = FeatureEncoder::fit(&features, UnknownCategoryPolicy::UnknownBucket).unwrap();
        let config = ModelConfig {
            rnn_units: 4,
            dense_units: vec![8],
            branch_units: 4,
            epochs: 3,
            batch_size: 8,
            seed: Some(11),
            ..ModelConfig::default()
        };
        let mut model = RnnEstimator::build(encoder.schema(), config.clone()).unwrap();
        let x = encoder.transform_batch(&features).unwrap();
        let history = model.train(&x, &targets, None).unwrap();
        let test_metrics = crate::model_evaluation::evaluate(&model, &x, &targets).unwrap();
        let metadata = ArtifactMetadata {
            model_name: "rnn_duration_estimator".to_string(),
            created_at: Utc::now(),
            training_type: TrainingType::Initial,
            model_config: config,
            dataset: DatasetStats::default(),
            epochs_trained: history.epochs_trained(),
            stop_reason: history.stop_reason,
            test_metrics,
            segments: Vec::new(),
            feature_importance: Vec::new(),
            history,
        };
        TrainedArtifact::new(version, model, encoder, metadata).unwrap()
    }

    #[test]
    fn test_nothing_published_initially() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert_eq!(store.current_version().unwrap(), None);
        assert!(matches!(store.load_current(), Err(ArtifactLoadError::NothingPublished { .. })));
    }

    #[test]
    fn test_write_promote_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let artifact = tiny_artifact("v1");
        store.write_version(&artifact).unwrap();
        assert_eq!(store.current_version().unwrap(), None);

        store.promote("v1").unwrap();
        let loaded = store.load_current().unwrap();
        assert_eq!(loaded.version(), "v1");
        assert_eq!(loaded.metadata(), artifact.metadata());

        let features = TaskFeatures::new("Backend", "Mantenimiento");
        assert_eq!(loaded.estimate_hours(&features).unwrap(), artifact.estimate_hours(&features).unwrap());
        assert_eq!(store.list_versions().unwrap(), vec!["v1"]);
    }

    #[test]
    fn test_promote_unknown_version_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.promote("missing").is_err());
        assert!(!dir.path().join(CURRENT_POINTER).exists());
    }

    #[test]
    fn test_mismatched_feature_dims_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let artifact = tiny_artifact("v1");
        let path = store.write_version(&artifact).unwrap();
        fs::write(path.join(FEATURE_DIMS_FILE), r#"{"numeric": 11, "task_type": 2, "phase": 2}"#).unwrap();

        assert!(matches!(store.load_version("v1"), Err(ArtifactLoadError::Incompatible { .. })));
    }

    #[test]
    fn test_version_ids_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let first = store.new_version_id();
        fs::create_dir_all(store.version_dir(&first)).unwrap();
        let second = store.new_version_id();
        assert_ne!(first, second);
    }
}
