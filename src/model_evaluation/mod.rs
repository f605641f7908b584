pub mod evaluation_metrics;
pub mod feature_importance;
pub mod metrics_history;
pub mod segmented_evaluation;

pub use evaluation_metrics::{Metrics, evaluate, regression_metrics};
pub use feature_importance::{FeatureImportance, permutation_importance};
pub use metrics_history::{MetricsHistory, MetricsHistoryEntry, TrainingType};
pub use segmented_evaluation::{Segment, SegmentReport, default_size_segments, segmented_evaluation};
