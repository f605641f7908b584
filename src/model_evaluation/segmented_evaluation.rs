use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::duration_model::RnnEstimator;
use crate::errors::{EvaluationError, ModelError};
use crate::model_evaluation::evaluation_metrics::{Metrics, regression_metrics};

/// A named predicate over the actual duration.
pub struct Segment {
    name: String,
    predicate: Box<dyn Fn(f64) -> bool + Send + Sync>,
}

impl Segment {
    pub fn new(name: impl Into<String>, predicate: impl Fn(f64) -> bool + Send + Sync + 'static) -> Self {
        Segment { name: name.into(), predicate: Box::new(predicate) }
    }

    /// Durations in `(low, high]`; an open bound is unbounded.
    pub fn range(name: impl Into<String>, low: Option<f64>, high: Option<f64>) -> Self {
        Segment::new(name, move |hours| low.is_none_or(|low| hours > low) && high.is_none_or(|high| hours <= high))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, hours: f64) -> bool {
        (self.predicate)(hours)
    }
}

/// Small, medium, large and very large tasks by actual hours.
pub fn default_size_segments() -> Vec<Segment> {
    vec![
        Segment::range("small (<=5h)", None, Some(5.0)),
        Segment::range("medium (5-20h)", Some(5.0), Some(20.0)),
        Segment::range("large (20-40h)", Some(20.0), Some(40.0)),
        Segment::range("very large (>40h)", Some(40.0), None),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentReport {
    pub name: String,
    pub count: usize,
    /// `None` for a segment with no samples.
    pub metrics: Option<Metrics>,
}

/// Scores the model separately on the samples each segment selects.
pub fn segmented_evaluation(
    model: &RnnEstimator,
    x: &Array2<f64>,
    y: &[f64],
    segments: &[Segment],
) -> Result<Vec<SegmentReport>, EvaluationError> {
    if x.nrows() != y.len() {
        return Err(ModelError::LengthMismatch { features: x.nrows(), targets: y.len() }.into());
    }
    let predictions = if x.nrows() == 0 { Vec::new() } else { model.predict_batch(x)?.to_vec() };
    segment_predictions(y, &predictions, segments)
}

pub(crate) fn segment_predictions(
    y: &[f64],
    predictions: &[f64],
    segments: &[Segment],
) -> Result<Vec<SegmentReport>, EvaluationError> {
    let mut reports = Vec::with_capacity(segments.len());
    for segment in segments {
        let (actual, predicted): (Vec<f64>, Vec<f64>) = y
            .iter()
            .zip(predictions)
            .filter(|&(&actual, _)| segment.contains(actual))
            .map(|(&actual, &predicted)| (actual, predicted))
            .unzip();
        let metrics = if actual.is_empty() { None } else { Some(regression_metrics(&actual, &predicted)?) };
        tracing::debug!(segment = segment.name(), count = actual.len(), "segment evaluated");
        reports.push(SegmentReport { name: segment.name.clone(), count: actual.len(), metrics });
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_segments_partition_all_samples() {
        let y = [1.0, 5.0, 5.5, 20.0, 21.0, 40.0, 40.5, 120.0];
        let predictions = [2.0; 8];
        let reports = segment_predictions(&y, &predictions, &default_size_segments()).unwrap();

        let counts: Vec<usize> = reports.iter().map(|r| r.count).collect();
        assert_eq!(counts, vec![2, 2, 2, 2]);
        assert_eq!(counts.iter().sum::<usize>(), y.len());
    }

    #[test]
    fn test_empty_segment_reports_no_metrics() {
        let y = [2.0, 3.0];
        let reports = segment_predictions(&y, &[2.0, 3.0], &default_size_segments()).unwrap();
        assert!(reports[0].metrics.is_some());
        assert_eq!(reports[3].count, 0);
        assert_eq!(reports[3].metrics, None);
    }

    #[test]
    fn test_custom_predicate() {
        let even_hours = Segment::new("even", |hours| hours as i64 % 2 == 0);
        let reports = segment_predictions(&[2.0, 3.0, 4.0], &[2.0, 2.0, 2.0], &[even_hours]).unwrap();
        assert_eq!(reports[0].count, 2);
        assert_eq!(reports[0].metrics.as_ref().map(|m| m.count), Some(2));
    }
}
