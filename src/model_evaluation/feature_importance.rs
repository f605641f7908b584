use std::ops::Range;

use ndarray::{Array2, Axis, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::duration_model::RnnEstimator;
use crate::errors::{EvaluationError, ModelError};
use crate::feature_encoding::FeatureSchema;
use crate::feature_encoding::task_features::NUMERIC_FEATURE_NAMES;
use crate::model_evaluation::evaluation_metrics::regression_metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    /// Mean increase in MSE when the feature is shuffled.
    pub importance: f64,
    pub importance_std: f64,
    /// Share of the summed positive importances.
    pub normalized: f64,
}

/// Column groups permuted together: each numeric column alone, then each
/// one-hot block as a whole. Numeric columns keep their feature names only
/// when the schema has the standard numeric layout.
fn feature_groups(schema: &FeatureSchema) -> Vec<(String, Range<usize>)> {
    let names = (schema.numeric() == NUMERIC_FEATURE_NAMES.len()).then_some(&NUMERIC_FEATURE_NAMES);
    let mut groups: Vec<(String, Range<usize>)> = schema
        .numeric_range()
        .map(|i| {
            let name = names.map(|n| n[i].to_string()).unwrap_or_else(|| format!("numeric_{i}"));
            (name, i..i + 1)
        })
        .collect();
    groups.push(("task_type".to_string(), schema.task_type_range()));
    groups.push(("phase".to_string(), schema.phase_range()));
    groups
}

fn mse(model: &RnnEstimator, x: &Array2<f64>, y: &[f64]) -> Result<f64, EvaluationError> {
    let predictions = model.predict_batch(x)?;
    Ok(regression_metrics(y, &predictions.to_vec())?.mse)
}

/// Grouped permutation importance, sorted most important first.
pub fn permutation_importance(
    model: &RnnEstimator,
    x: &Array2<f64>,
    y: &[f64],
    repeats: usize,
    seed: u64,
) -> Result<Vec<FeatureImportance>, EvaluationError> {
    if x.nrows() != y.len() {
        return Err(ModelError::LengthMismatch { features: x.nrows(), targets: y.len() }.into());
    }
    if x.nrows() == 0 {
        return Err(EvaluationError::EmptySet);
    }
    let repeats = repeats.max(1);
    let baseline = mse(model, x, y)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..x.nrows()).collect();

    let mut results = Vec::new();
    for (feature, columns) in feature_groups(&model.schema()) {
        let mut deltas = Vec::with_capacity(repeats);
        for _ in 0..repeats {
            order.shuffle(&mut rng);
            let mut permuted = x.clone();
            let shuffled = x.slice(s![.., columns.clone()]).select(Axis(0), &order);
            permuted.slice_mut(s![.., columns.clone()]).assign(&shuffled);
            deltas.push(mse(model, &permuted, y)? - baseline);
        }
        let mean = deltas.iter().sum::<f64>() / repeats as f64;
        let std = (deltas.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / repeats as f64).sqrt();
        results.push(FeatureImportance { feature, importance: mean, importance_std: std, normalized: 0.0 });
    }

    let positive_total: f64 = results.iter().map(|r| r.importance.max(0.0)).sum();
    if positive_total > 0.0 {
        for result in results.iter_mut() {
            result.normalized = result.importance.max(0.0) / positive_total;
        }
    }
    results.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    tracing::info!(
        baseline_mse = baseline,
        top = results.first().map(|r| r.feature.as_str()).unwrap_or(""),
        "permutation importance computed"
    );
    Ok(results)
}
