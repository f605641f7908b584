use std::io;
use std::path::PathBuf;

use crate::feature_encoding::FeatureSchema;

/// Failures turning task attributes into a model input vector.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("unknown {field} category '{value}'")]
    UnknownCategory { field: &'static str, value: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidFeature { field: &'static str, reason: String },

    #[error("feature layout mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: FeatureSchema, found: String },

    #[error("cannot fit an encoder on an empty set of rows")]
    EmptyFit,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("training set is empty")]
    EmptyTrainingSet,

    #[error("features and targets differ in length ({features} vs {targets})")]
    LengthMismatch { features: usize, targets: usize },

    #[error("training diverged at epoch {epoch}: loss is not finite")]
    Diverged { epoch: usize },

    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactLoadError {
    #[error("no artifact has been published in {dir}")]
    NothingPublished { dir: PathBuf },

    #[error("artifact file missing: {path}")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt artifact file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("artifact {version} is incompatible: {source}")]
    Incompatible {
        version: String,
        #[source]
        source: EncodingError,
    },
}

/// Failures talking to the task-tracking store or writing local files.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("task {0} does not exist")]
    TaskNotFound(u64),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialization error on {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("task store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("cannot evaluate on an empty set")]
    EmptySet,

    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("insufficient training data: {found} usable rows, at least {required} required")]
    InsufficientData { found: usize, required: usize },

    #[error("invalid dataset: {0}")]
    InvalidDataset(String),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    ArtifactLoad(#[from] ArtifactLoadError),
}

#[derive(Debug, thiserror::Error)]
pub enum EstimationError {
    #[error("task {0} not found")]
    TaskNotFound(u64),

    #[error("project {0} not found")]
    ProjectNotFound(u64),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    ArtifactLoad(#[from] ArtifactLoadError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    TaskFile(#[from] TrainingError),
}
