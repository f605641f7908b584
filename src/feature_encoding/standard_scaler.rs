use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::errors::EncodingError;

/// Variances at or below this are treated as constant columns.
const DEGENERATE_VARIANCE: f64 = 1e-12;

/// Per-column standardization `(x - mean) / scale` fitted on training rows.
/// Columns with no variance are flagged degenerate and passed through as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
    var: Vec<f64>,
    degenerate: Vec<bool>,
}

impl StandardScaler {
    /// Fits on the rows of `x` using population statistics.
    pub fn fit(x: &Array2<f64>) -> Result<Self, EncodingError> {
        if x.nrows() == 0 {
            return Err(EncodingError::EmptyFit);
        }
        let n = x.nrows() as f64;
        let mut mean = Vec::with_capacity(x.ncols());
        let mut var = Vec::with_capacity(x.ncols());
        for column in x.axis_iter(Axis(1)) {
            let m = column.sum() / n;
            let v = column.iter().map(|&xi| (xi - m) * (xi - m)).sum::<f64>() / n;
            mean.push(m);
            var.push(v);
        }
        let degenerate: Vec<bool> = var.iter().map(|&v| v <= DEGENERATE_VARIANCE).collect();
        let scale = var
            .iter()
            .zip(&degenerate)
            .map(|(&v, &flat)| if flat { 1.0 } else { v.sqrt() })
            .collect();
        Ok(StandardScaler { mean, scale, var, degenerate })
    }

    /// Fits on a single column of values, e.g. training targets.
    pub fn fit_column(values: &[f64]) -> Result<Self, EncodingError> {
        let column = Array2::from_shape_vec((values.len(), 1), values.to_vec()).map_err(|e| {
            EncodingError::InvalidFeature { field: "target", reason: e.to_string() }
        })?;
        Self::fit(&column)
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    pub fn degenerate_columns(&self) -> Vec<usize> {
        self.degenerate
            .iter()
            .enumerate()
            .filter_map(|(i, &flat)| flat.then_some(i))
            .collect()
    }

    pub fn transform(&self, x: &[f64]) -> Result<Vec<f64>, EncodingError> {
        self.check_width(x.len())?;
        Ok(x.iter()
            .enumerate()
            .map(|(i, &xi)| if self.degenerate[i] { xi } else { (xi - self.mean[i]) / self.scale[i] })
            .collect())
    }

    pub fn inverse_transform(&self, x_scaled: &[f64]) -> Result<Vec<f64>, EncodingError> {
        self.check_width(x_scaled.len())?;
        Ok(x_scaled
            .iter()
            .enumerate()
            .map(|(i, &xi)| if self.degenerate[i] { xi } else { xi * self.scale[i] + self.mean[i] })
            .collect())
    }

    /// Scalar shortcuts for single-column scalers.
    pub fn transform_value(&self, value: f64) -> f64 {
        if self.degenerate.first().copied().unwrap_or(true) {
            value
        } else {
            (value - self.mean[0]) / self.scale[0]
        }
    }

    pub fn inverse_transform_value(&self, value: f64) -> f64 {
        if self.degenerate.first().copied().unwrap_or(true) {
            value
        } else {
            value * self.scale[0] + self.mean[0]
        }
    }

    pub fn variance(&self) -> &[f64] {
        &self.var
    }

    fn check_width(&self, found: usize) -> Result<(), EncodingError> {
        if found != self.width() {
            return Err(EncodingError::InvalidFeature {
                field: "numeric",
                reason: format!("expected {} values, got {}", self.width(), found),
            });
        }
        Ok(())
    }
}
