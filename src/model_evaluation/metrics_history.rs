use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration_model::ModelConfig;
use crate::errors::PersistenceError;
use crate::model_evaluation::evaluation_metrics::Metrics;
use crate::training::dataset::DatasetStats;
use crate::utils::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingType {
    Initial,
    Retraining,
    Evaluation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub training_type: TrainingType,
    pub model_version: String,
    pub metrics: Metrics,
    pub dataset: DatasetStats,
    pub model_config: ModelConfig,
    pub epochs_trained: usize,
}

/// Append-only JSON list of training and evaluation runs.
#[derive(Debug, Clone)]
pub struct MetricsHistory {
    path: PathBuf,
}

impl MetricsHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MetricsHistory { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every entry. A missing file is an empty history; an unreadable
    /// one is an error.
    pub fn entries(&self) -> Result<Vec<MetricsHistoryEntry>, PersistenceError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(PersistenceError::Io { path: self.path.clone(), source }),
        };
        serde_json::from_str(&content).map_err(|source| PersistenceError::Serialization { path: self.path.clone(), source })
    }

    /// Appends one entry and returns the new length. The file is replaced
    /// atomically; a corrupt history is left untouched.
    pub fn append(&self, entry: MetricsHistoryEntry) -> Result<usize, PersistenceError> {
        let mut entries = self.entries()?;
        entries.push(entry);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| PersistenceError::Io { path: parent.to_path_buf(), source })?;
        }
        write_json_atomic(&self.path, &entries)?;
        tracing::info!(path = %self.path.display(), entries = entries.len(), "metrics history updated");
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: &str) -> MetricsHistoryEntry {
        MetricsHistoryEntry {
            timestamp: Utc::now(),
            training_type: TrainingType::Initial,
            model_version: version.to_string(),
            metrics: Metrics {
                mse: 1.0,
                rmse: 1.0,
                mae: 0.5,
                mape: 0.1,
                r2: Some(0.8),
                accuracy: 0.4,
                precision: 0.4,
                recall: 0.4,
                f1: 0.4,
                count: 10,
            },
            dataset: DatasetStats::default(),
            model_config: ModelConfig::default(),
            epochs_trained: 12,
        }
    }

    #[test]
    fn test_append_extends_history() {
        let dir = tempfile::tempdir().unwrap();
        let history = MetricsHistory::new(dir.path().join("metrics_history.json"));
        assert!(history.entries().unwrap().is_empty());

        assert_eq!(history.append(entry("v1")).unwrap(), 1);
        assert_eq!(history.append(entry("v2")).unwrap(), 2);
        let versions: Vec<String> = history.entries().unwrap().into_iter().map(|e| e.model_version).collect();
        assert_eq!(versions, vec!["v1", "v2"]);
    }

    #[test]
    fn test_corrupt_history_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics_history.json");
        fs::write(&path, "[{\"truncated\":").unwrap();
        let history = MetricsHistory::new(&path);

        assert!(matches!(history.append(entry("v3")), Err(PersistenceError::Serialization { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), "[{\"truncated\":");
    }

    #[test]
    fn test_undefined_r2_survives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let history = MetricsHistory::new(dir.path().join("metrics_history.json"));
        let mut undefined = entry("v1");
        undefined.metrics.r2 = None;
        history.append(undefined.clone()).unwrap();
        assert_eq!(history.entries().unwrap(), vec![undefined]);
    }
}
