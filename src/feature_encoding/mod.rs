pub mod category_vocabulary;
pub mod feature_encoder;
pub mod standard_scaler;
pub mod task_features;

pub use category_vocabulary::UnknownCategoryPolicy;
pub use feature_encoder::{EncodedFeatures, FeatureEncoder, FeatureSchema};
pub use task_features::{ResourceAssignment, TaskAttributes, TaskFeatures};
