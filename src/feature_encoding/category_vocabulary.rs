use serde::{Deserialize, Serialize};

use crate::errors::EncodingError;

/// What to do with a category that was not seen at fit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownCategoryPolicy {
    /// Set the trailing "unknown" slot.
    #[default]
    UnknownBucket,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryField {
    TaskType,
    Phase,
}

impl CategoryField {
    pub fn as_str(self) -> &'static str {
        match self {
            CategoryField::TaskType => "task_type",
            CategoryField::Phase => "phase",
        }
    }
}

/// Sorted category list for one-hot encoding. The encoded block has one
/// slot per known category plus a trailing unknown slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryVocabulary {
    field: CategoryField,
    categories: Vec<String>,
}

impl CategoryVocabulary {
    pub fn fit<'a>(field: CategoryField, values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut categories: Vec<String> = values.into_iter().map(str::to_string).collect();
        categories.sort();
        categories.dedup();
        CategoryVocabulary { field, categories }
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn width(&self) -> usize {
        self.categories.len() + 1
    }

    pub fn index_of(&self, value: &str) -> Option<usize> {
        self.categories.binary_search_by(|c| c.as_str().cmp(value)).ok()
    }

    pub fn encode_into(
        &self,
        value: &str,
        policy: UnknownCategoryPolicy,
        out: &mut Vec<f64>,
    ) -> Result<(), EncodingError> {
        let slot = match (self.index_of(value), policy) {
            (Some(i), _) => i,
            (None, UnknownCategoryPolicy::UnknownBucket) => {
                tracing::debug!(field = self.field.as_str(), value, "unseen category mapped to unknown slot");
                self.categories.len()
            }
            (None, UnknownCategoryPolicy::Reject) => {
                return Err(EncodingError::UnknownCategory {
                    field: self.field.as_str(),
                    value: value.to_string(),
                });
            }
        };
        let start = out.len();
        out.resize(start + self.width(), 0.0);
        out[start + slot] = 1.0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_sorts_and_dedups() {
        let vocabulary = CategoryVocabulary::fit(CategoryField::TaskType, ["Testing", "Backend", "Testing", "Frontend"]);
        assert_eq!(vocabulary.categories(), &["Backend", "Frontend", "Testing"]);
        assert_eq!(vocabulary.width(), 4);
    }

    #[test]
    fn test_unknown_value_uses_trailing_slot() {
        let vocabulary = CategoryVocabulary::fit(CategoryField::TaskType, ["Backend", "Frontend"]);
        let mut out = Vec::new();
        vocabulary.encode_into("Frontend", UnknownCategoryPolicy::UnknownBucket, &mut out).unwrap();
        vocabulary.encode_into("Blockchain", UnknownCategoryPolicy::UnknownBucket, &mut out).unwrap();
        assert_eq!(out, vec![0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_reject_policy_fails_on_unknown_value() {
        let vocabulary = CategoryVocabulary::fit(CategoryField::Phase, ["Mantenimiento"]);
        let mut out = Vec::new();
        let result = vocabulary.encode_into("Cierre", UnknownCategoryPolicy::Reject, &mut out);
        assert!(matches!(result, Err(EncodingError::UnknownCategory { field: "phase", .. })));
        assert!(out.is_empty());
    }
}
