pub mod api;
pub mod duration_model;
pub mod errors;
pub mod estimation;
pub mod feature_encoding;
pub mod model_evaluation;
pub mod training;
pub mod utils;
