use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::Path;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::errors::{ArtifactLoadError, EncodingError, PersistenceError};
use crate::feature_encoding::category_vocabulary::{
    CategoryField, CategoryVocabulary, UnknownCategoryPolicy,
};
use crate::feature_encoding::standard_scaler::StandardScaler;
use crate::feature_encoding::task_features::{NUMERIC_FEATURE_NAMES, TaskFeatures};
use crate::utils::{read_json, write_json_atomic};

/// Block widths of an encoded vector: numeric, task type, phase.
///
/// Only a fitted encoder produces one, and the model is built from it, so the
/// two always agree on the vector layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureSchema {
    numeric: usize,
    task_type: usize,
    phase: usize,
}

impl FeatureSchema {
    pub(crate) fn new(numeric: usize, task_type: usize, phase: usize) -> Self {
        FeatureSchema { numeric, task_type, phase }
    }

    pub fn numeric(&self) -> usize {
        self.numeric
    }

    pub fn task_type(&self) -> usize {
        self.task_type
    }

    pub fn phase(&self) -> usize {
        self.phase
    }

    pub fn width(&self) -> usize {
        self.numeric + self.task_type + self.phase
    }

    pub fn numeric_range(&self) -> Range<usize> {
        0..self.numeric
    }

    pub fn task_type_range(&self) -> Range<usize> {
        self.numeric..self.numeric + self.task_type
    }

    pub fn phase_range(&self) -> Range<usize> {
        self.numeric + self.task_type..self.width()
    }

    pub fn check_width(&self, found: usize) -> Result<(), EncodingError> {
        if found != self.width() {
            return Err(EncodingError::SchemaMismatch {
                expected: *self,
                found: format!("{found} columns"),
            });
        }
        Ok(())
    }

    pub fn ensure_matches(&self, other: &FeatureSchema) -> Result<(), EncodingError> {
        if self != other {
            return Err(EncodingError::SchemaMismatch { expected: *self, found: other.to_string() });
        }
        Ok(())
    }
}

impl fmt::Display for FeatureSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "numeric={} task_type={} phase={}", self.numeric, self.task_type, self.phase)
    }
}

/// One encoded task, tagged with the layout that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFeatures {
    pub values: Array1<f64>,
    pub schema: FeatureSchema,
}

/// Fitted vocabularies and numeric scaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEncoder {
    numeric_scaler: StandardScaler,
    task_types: CategoryVocabulary,
    phases: CategoryVocabulary,
    unknown_policy: UnknownCategoryPolicy,
}

impl FeatureEncoder {
    /// Fits vocabularies and scaler on the given rows. Call with the training
    /// split only.
    pub fn fit(rows: &[TaskFeatures], unknown_policy: UnknownCategoryPolicy) -> Result<Self, EncodingError> {
        let task_types = CategoryVocabulary::fit(CategoryField::TaskType, rows.iter().map(|r| r.task_type.as_str()));
        let phases = CategoryVocabulary::fit(CategoryField::Phase, rows.iter().map(|r| r.phase.as_str()));
        Self::fit_numeric(rows, task_types, phases, unknown_policy)
    }

    /// Fits with an explicit category catalogue instead of the categories
    /// present in `rows`.
    pub fn fit_with_categories(
        rows: &[TaskFeatures],
        task_types: &[String],
        phases: &[String],
        unknown_policy: UnknownCategoryPolicy,
    ) -> Result<Self, EncodingError> {
        let task_types = CategoryVocabulary::fit(CategoryField::TaskType, task_types.iter().map(String::as_str));
        let phases = CategoryVocabulary::fit(CategoryField::Phase, phases.iter().map(String::as_str));
        Self::fit_numeric(rows, task_types, phases, unknown_policy)
    }

    fn fit_numeric(
        rows: &[TaskFeatures],
        task_types: CategoryVocabulary,
        phases: CategoryVocabulary,
        unknown_policy: UnknownCategoryPolicy,
    ) -> Result<Self, EncodingError> {
        if rows.is_empty() {
            return Err(EncodingError::EmptyFit);
        }
        let mut numeric = Array2::zeros((rows.len(), NUMERIC_FEATURE_NAMES.len()));
        for (i, row) in rows.iter().enumerate() {
            row.validate()?;
            for (j, value) in row.numeric_vector().into_iter().enumerate() {
                numeric[[i, j]] = value;
            }
        }
        let numeric_scaler = StandardScaler::fit(&numeric)?;
        for column in numeric_scaler.degenerate_columns() {
            tracing::warn!(feature = NUMERIC_FEATURE_NAMES[column], "feature has no variance in training rows; left unscaled");
        }
        tracing::info!(
            rows = rows.len(),
            task_types = task_types.categories().len(),
            phases = phases.categories().len(),
            "fitted feature encoder"
        );
        Ok(FeatureEncoder { numeric_scaler, task_types, phases, unknown_policy })
    }

    pub fn schema(&self) -> FeatureSchema {
        FeatureSchema::new(self.numeric_scaler.width(), self.task_types.width(), self.phases.width())
    }

    pub fn task_types(&self) -> &[String] {
        self.task_types.categories()
    }

    pub fn phases(&self) -> &[String] {
        self.phases.categories()
    }

    pub fn transform(&self, features: &TaskFeatures) -> Result<EncodedFeatures, EncodingError> {
        features.validate()?;
        let mut values = self.numeric_scaler.transform(&features.numeric_vector())?;
        self.task_types.encode_into(&features.task_type, self.unknown_policy, &mut values)?;
        self.phases.encode_into(&features.phase, self.unknown_policy, &mut values)?;
        let schema = self.schema();
        schema.check_width(values.len())?;
        Ok(EncodedFeatures { values: Array1::from(values), schema })
    }

    pub fn transform_batch(&self, rows: &[TaskFeatures]) -> Result<Array2<f64>, EncodingError> {
        let schema = self.schema();
        let mut matrix = Array2::zeros((rows.len(), schema.width()));
        for (mut target, row) in matrix.rows_mut().into_iter().zip(rows) {
            target.assign(&self.transform(row)?.values);
        }
        Ok(matrix)
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactLoadError> {
        read_json(path)
    }
}

/// Reads a `feature_dims.json` descriptor.
pub fn load_schema(path: &Path) -> Result<FeatureSchema, ArtifactLoadError> {
    read_json(path)
}

pub fn save_schema(path: &Path, schema: &FeatureSchema) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| PersistenceError::Io { path: parent.to_path_buf(), source })?;
    }
    write_json_atomic(path, schema)
}
