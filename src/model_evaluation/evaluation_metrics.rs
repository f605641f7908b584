use std::collections::BTreeMap;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::duration_model::RnnEstimator;
use crate::errors::{EvaluationError, ModelError};

/// Regression metrics over a set of predictions.
///
/// `accuracy`, `precision`, `recall` and `f1` treat each rounded duration as
/// a class and are support-weighted multi-class scores. They are kept for
/// comparison with earlier reports and are not a standard regression measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    pub mape: f64,
    /// `None` when the target is constant.
    pub r2: Option<f64>,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub count: usize,
}

impl Metrics {
    /// R² clamped to `[0, 1]`, or 0 when undefined.
    pub fn confidence(&self) -> f64 {
        self.r2.map(|r2| r2.clamp(0.0, 1.0)).unwrap_or(0.0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ClassCounts {
    support: usize,
    predicted: usize,
    true_positive: usize,
}

struct ClassificationScores {
    accuracy: f64,
    precision: f64,
    recall: f64,
    f1: f64,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 { 0.0 } else { numerator as f64 / denominator as f64 }
}

fn rounded_classification_scores(y_true: &[f64], y_pred: &[f64]) -> ClassificationScores {
    let mut classes: BTreeMap<i64, ClassCounts> = BTreeMap::new();
    let mut correct = 0;
    for (&t, &p) in y_true.iter().zip(y_pred) {
        let (t, p) = (t.round_ties_even() as i64, p.round_ties_even() as i64);
        classes.entry(t).or_default().support += 1;
        classes.entry(p).or_default().predicted += 1;
        if t == p {
            correct += 1;
            classes.entry(t).or_default().true_positive += 1;
        }
    }

    let n = y_true.len();
    let (mut precision, mut recall, mut f1) = (0.0, 0.0, 0.0);
    for counts in classes.values() {
        let weight = ratio(counts.support, n);
        let p = ratio(counts.true_positive, counts.predicted);
        let r = ratio(counts.true_positive, counts.support);
        precision += weight * p;
        recall += weight * r;
        if p + r > 0.0 {
            f1 += weight * 2.0 * p * r / (p + r);
        }
    }
    ClassificationScores { accuracy: ratio(correct, n), precision, recall, f1 }
}

/// Computes every metric for paired targets and predictions.
pub fn regression_metrics(y_true: &[f64], y_pred: &[f64]) -> Result<Metrics, EvaluationError> {
    if y_true.len() != y_pred.len() {
        return Err(ModelError::LengthMismatch { features: y_pred.len(), targets: y_true.len() }.into());
    }
    if y_true.is_empty() {
        return Err(EvaluationError::EmptySet);
    }
    let n = y_true.len() as f64;
    let mean_true = y_true.iter().sum::<f64>() / n;

    let (mut ss_res, mut abs_sum, mut pct_sum, mut ss_tot) = (0.0, 0.0, 0.0, 0.0);
    for (&t, &p) in y_true.iter().zip(y_pred) {
        let err = t - p;
        ss_res += err * err;
        abs_sum += err.abs();
        pct_sum += err.abs() / t.abs().max(f64::EPSILON);
        ss_tot += (t - mean_true) * (t - mean_true);
    }
    let mse = ss_res / n;
    let r2 = (ss_tot > 0.0).then(|| 1.0 - ss_res / ss_tot);
    let scores = rounded_classification_scores(y_true, y_pred);

    Ok(Metrics {
        mse,
        rmse: mse.sqrt(),
        mae: abs_sum / n,
        mape: pct_sum / n,
        r2,
        accuracy: scores.accuracy,
        precision: scores.precision,
        recall: scores.recall,
        f1: scores.f1,
        count: y_true.len(),
    })
}

/// Predicts `x` with `model` and scores the predictions against `y`.
pub fn evaluate(model: &RnnEstimator, x: &Array2<f64>, y: &[f64]) -> Result<Metrics, EvaluationError> {
    if x.nrows() == 0 {
        return Err(EvaluationError::EmptySet);
    }
    let predictions = model.predict_batch(x)?;
    let metrics = regression_metrics(y, &predictions.to_vec())?;
    tracing::info!(
        count = metrics.count,
        mse = metrics.mse,
        rmse = metrics.rmse,
        mae = metrics.mae,
        r2 = ?metrics.r2,
        "evaluated model"
    );
    Ok(metrics)
}
