pub mod batch_prediction;
pub mod estimation_service;
pub mod task_store;

pub use batch_prediction::{PredictionSummary, predict_csv};
pub use estimation_service::{
    EstimationContext, EstimationOutcome, EstimationResult, EstimationService, ProjectEstimate,
    ReestimationOutcome,
};
pub use task_store::{LocalTaskStore, TaskRecord, TaskStore};
