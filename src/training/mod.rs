pub mod artifact_store;
pub mod data_split;
pub mod dataset;
pub mod synthetic_data;
pub mod training_orchestrator;

pub use artifact_store::{ArtifactMetadata, ArtifactStore, TrainedArtifact};
pub use dataset::{DataSource, Dataset, DatasetStats, LabeledTask, collect_dataset};
pub use training_orchestrator::{TrainingConfig, TrainingOutcome, evaluate_published, retrain, run_training};
