pub mod adam;
pub mod layers;
pub mod model_config;
pub mod recurrent;
pub mod rnn_estimator;

pub use model_config::{ModelConfig, RnnType};
pub use rnn_estimator::{MIN_DURATION_HOURS, RnnEstimator, StopReason, TrainingHistory};
