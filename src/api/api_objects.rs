use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::duration_model::ModelConfig;
use crate::estimation::EstimationService;
use crate::model_evaluation::Metrics;
use crate::training::TrainingConfig;

/// Shared by every worker of the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub service: EstimationService,
    pub model_config: ModelConfig,
    pub training_config: TrainingConfig,
    /// Held for the whole of a retraining run; a second request is refused.
    pub retrain_guard: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(service: EstimationService, model_config: ModelConfig, training_config: TrainingConfig) -> Self {
        AppState { service, model_config, training_config, retrain_guard: Arc::new(Mutex::new(())) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl ToString) -> Self {
        ErrorResponse { error: error.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub reloaded: bool,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainResponse {
    pub version: String,
    pub epochs_trained: usize,
    pub history_entries: usize,
    pub test_metrics: Metrics,
}
