use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::errors::EncodingError;

pub const MAX_RESOURCE_SLOTS: usize = 3;
pub const DEFAULT_TASK_TYPE: &str = "Backend";
pub const DEFAULT_PHASE: &str = "Construcción/Desarrollo";
pub const DEFAULT_CLARITY: f64 = 0.7;

/// Names of the numeric block, in encoding order.
pub const NUMERIC_FEATURE_NAMES: [&str; 11] = [
    "complexity",
    "resource_count",
    "workload_r1",
    "experience_r1",
    "workload_r2",
    "experience_r2",
    "workload_r3",
    "experience_r3",
    "team_experience",
    "requirement_clarity",
    "estimated_size",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceAssignment {
    /// Share of the resource's capacity already committed.
    pub workload: f64,
    /// 1 (junior) to 5 (expert).
    pub experience: u8,
}

/// Raw attributes of one task, prior to encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFeatures {
    pub complexity: u8,
    /// Carried for callers, not part of the encoded vector.
    pub priority: u8,
    pub task_type: String,
    pub phase: String,
    pub resource_count: u32,
    resources: Vec<ResourceAssignment>,
    pub team_experience: u8,
    pub requirement_clarity: f64,
    pub estimated_size: u32,
}

impl TaskFeatures {
    pub fn new(task_type: impl Into<String>, phase: impl Into<String>) -> Self {
        TaskFeatures {
            complexity: 3,
            priority: 2,
            task_type: task_type.into(),
            phase: phase.into(),
            resource_count: 1,
            resources: Vec::new(),
            team_experience: 3,
            requirement_clarity: DEFAULT_CLARITY,
            estimated_size: 5,
        }
    }

    /// Replaces the assignments. Only the first three resources get a slot;
    /// `resource_count` is raised to cover every assignment given.
    pub fn with_resources(mut self, resources: Vec<ResourceAssignment>) -> Self {
        self.resource_count = self.resource_count.max(resources.len() as u32).max(1);
        self.resources = resources.into_iter().take(MAX_RESOURCE_SLOTS).collect();
        self
    }

    pub fn resources(&self) -> &[ResourceAssignment] {
        &self.resources
    }

    pub fn validate(&self) -> Result<(), EncodingError> {
        if self.resources.len() > MAX_RESOURCE_SLOTS {
            return Err(EncodingError::InvalidFeature {
                field: "resources",
                reason: format!("at most {MAX_RESOURCE_SLOTS} assignments are encoded"),
            });
        }
        check_ordinal("complexity", self.complexity, 1..=5)?;
        check_ordinal("priority", self.priority, 1..=3)?;
        check_ordinal("team_experience", self.team_experience, 1..=5)?;
        if !(0.0..=1.0).contains(&self.requirement_clarity) {
            return Err(EncodingError::InvalidFeature {
                field: "requirement_clarity",
                reason: format!("{} is outside [0, 1]", self.requirement_clarity),
            });
        }
        for (slot, resource) in self.resources.iter().enumerate() {
            if !resource.workload.is_finite() || resource.workload < 0.0 {
                return Err(EncodingError::InvalidFeature {
                    field: "workload",
                    reason: format!("slot {} holds {}", slot + 1, resource.workload),
                });
            }
            // 0 marks an experience level missing from the source row.
            check_ordinal("experience", resource.experience, 0..=5)?;
        }
        Ok(())
    }

    /// Numeric block in `NUMERIC_FEATURE_NAMES` order. Unused slots are 0.
    pub fn numeric_vector(&self) -> Vec<f64> {
        let mut slots = [(0.0, 0.0); MAX_RESOURCE_SLOTS];
        for (slot, resource) in slots.iter_mut().zip(&self.resources) {
            *slot = (resource.workload, resource.experience as f64);
        }
        vec![
            self.complexity as f64,
            self.resource_count as f64,
            slots[0].0,
            slots[0].1,
            slots[1].0,
            slots[1].1,
            slots[2].0,
            slots[2].1,
            self.team_experience as f64,
            self.requirement_clarity,
            self.estimated_size as f64,
        ]
    }
}

fn check_ordinal(field: &'static str, value: u8, range: RangeInclusive<u8>) -> Result<(), EncodingError> {
    if range.contains(&value) {
        return Ok(());
    }
    Err(EncodingError::InvalidFeature {
        field,
        reason: format!("{value} is outside {}-{}", range.start(), range.end()),
    })
}

fn default_complexity() -> u8 {
    3
}
fn default_priority() -> u8 {
    2
}
fn default_task_type() -> String {
    DEFAULT_TASK_TYPE.to_string()
}
fn default_phase() -> String {
    DEFAULT_PHASE.to_string()
}
fn default_resource_count() -> u32 {
    1
}
fn default_team_experience() -> u8 {
    3
}
fn default_clarity() -> f64 {
    DEFAULT_CLARITY
}
fn default_size() -> u32 {
    5
}

/// Flat record accepted from callers and read from training files.
/// Every omitted field takes its documented default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttributes {
    #[serde(default = "default_complexity")]
    pub complexity: u8,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default = "default_phase")]
    pub phase: String,
    #[serde(default = "default_resource_count")]
    pub resource_count: u32,
    #[serde(default)]
    pub workload_r1: f64,
    #[serde(default)]
    pub experience_r1: u8,
    #[serde(default)]
    pub workload_r2: f64,
    #[serde(default)]
    pub experience_r2: u8,
    #[serde(default)]
    pub workload_r3: f64,
    #[serde(default)]
    pub experience_r3: u8,
    #[serde(default = "default_team_experience")]
    pub team_experience: u8,
    #[serde(default = "default_clarity")]
    pub requirement_clarity: f64,
    #[serde(default = "default_size")]
    pub estimated_size: u32,
}

impl Default for TaskAttributes {
    fn default() -> Self {
        TaskAttributes {
            complexity: default_complexity(),
            priority: default_priority(),
            task_type: default_task_type(),
            phase: default_phase(),
            resource_count: default_resource_count(),
            workload_r1: 0.0,
            experience_r1: 0,
            workload_r2: 0.0,
            experience_r2: 0,
            workload_r3: 0.0,
            experience_r3: 0,
            team_experience: default_team_experience(),
            requirement_clarity: default_clarity(),
            estimated_size: default_size(),
        }
    }
}

impl From<TaskAttributes> for TaskFeatures {
    fn from(attributes: TaskAttributes) -> Self {
        let resource_count = attributes.resource_count.max(1);
        let slots = [
            (attributes.workload_r1, attributes.experience_r1),
            (attributes.workload_r2, attributes.experience_r2),
            (attributes.workload_r3, attributes.experience_r3),
        ];
        let resources = slots
            .into_iter()
            .take((resource_count as usize).min(MAX_RESOURCE_SLOTS))
            .map(|(workload, experience)| ResourceAssignment { workload, experience })
            .collect();
        TaskFeatures {
            complexity: attributes.complexity,
            priority: attributes.priority,
            task_type: attributes.task_type,
            phase: attributes.phase,
            resource_count,
            resources,
            team_experience: attributes.team_experience,
            requirement_clarity: attributes.requirement_clarity,
            estimated_size: attributes.estimated_size,
        }
    }
}

impl From<&TaskFeatures> for TaskAttributes {
    fn from(features: &TaskFeatures) -> Self {
        let slot = |i: usize| features.resources.get(i).copied();
        let workload = |i: usize| slot(i).map(|r| r.workload).unwrap_or(0.0);
        let experience = |i: usize| slot(i).map(|r| r.experience).unwrap_or(0);
        TaskAttributes {
            complexity: features.complexity,
            priority: features.priority,
            task_type: features.task_type.clone(),
            phase: features.phase.clone(),
            resource_count: features.resource_count,
            workload_r1: workload(0),
            experience_r1: experience(0),
            workload_r2: workload(1),
            experience_r2: experience(1),
            workload_r3: workload(2),
            experience_r3: experience(2),
            team_experience: features.team_experience,
            requirement_clarity: features.requirement_clarity,
            estimated_size: features.estimated_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_omitted_fields_take_defaults() {
        let attributes: TaskAttributes = serde_json::from_str(r#"{"complexity": 4}"#).unwrap();
        assert_eq!(attributes.complexity, 4);
        assert_eq!(attributes.task_type, "Backend");
        assert_eq!(attributes.phase, "Construcción/Desarrollo");
        assert_eq!(attributes.resource_count, 1);
        assert!((attributes.requirement_clarity - 0.7).abs() < 1e-12);
        assert_eq!(attributes.estimated_size, 5);
    }

    #[test]
    fn test_unused_resource_slots_are_zero() {
        let attributes = TaskAttributes {
            resource_count: 1,
            workload_r1: 0.5,
            experience_r1: 3,
            workload_r2: 0.9,
            experience_r2: 5,
            ..TaskAttributes::default()
        };
        let features = TaskFeatures::from(attributes);
        assert_eq!(features.resources().len(), 1);

        let numeric = features.numeric_vector();
        assert_eq!(numeric.len(), NUMERIC_FEATURE_NAMES.len());
        assert_eq!(&numeric[2..8], &[0.5, 3.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_validate_rejects_non_finite_values() {
        let mut features = TaskFeatures::new("Backend", "Mantenimiento");
        features.requirement_clarity = f64::NAN;
        assert!(matches!(
            features.validate(),
            Err(EncodingError::InvalidFeature { field: "requirement_clarity", .. })
        ));

        let features = TaskFeatures::new("Backend", "Mantenimiento").with_resources(vec![
            ResourceAssignment { workload: -1.0, experience: 2 },
        ]);
        assert!(features.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_ordinals() {
        let invalid = |change: fn(&mut TaskFeatures)| {
            let mut features = TaskFeatures::new("Backend", "Mantenimiento");
            change(&mut features);
            match features.validate() {
                Err(EncodingError::InvalidFeature { field, .. }) => field,
                other => panic!("expected an invalid feature, got {other:?}"),
            }
        };
        assert_eq!(invalid(|f| f.complexity = 0), "complexity");
        assert_eq!(invalid(|f| f.complexity = 6), "complexity");
        assert_eq!(invalid(|f| f.priority = 4), "priority");
        assert_eq!(invalid(|f| f.team_experience = 9), "team_experience");
        assert_eq!(invalid(|f| f.requirement_clarity = 1.5), "requirement_clarity");
        assert_eq!(invalid(|f| f.requirement_clarity = -0.1), "requirement_clarity");

        let features = TaskFeatures::new("Backend", "Mantenimiento")
            .with_resources(vec![ResourceAssignment { workload: 0.5, experience: 7 }]);
        assert!(matches!(features.validate(), Err(EncodingError::InvalidFeature { field: "experience", .. })));

        let unrecorded = TaskFeatures::new("Backend", "Mantenimiento")
            .with_resources(vec![ResourceAssignment { workload: 0.0, experience: 0 }]);
        assert!(unrecorded.validate().is_ok());
    }

    #[test]
    fn test_extra_assignments_keep_count_but_not_slots() {
        let assignment = ResourceAssignment { workload: 0.4, experience: 2 };
        let features = TaskFeatures::new("Frontend", "Mantenimiento").with_resources(vec![assignment; 4]);
        assert_eq!(features.resource_count, 4);
        assert_eq!(features.resources().len(), MAX_RESOURCE_SLOTS);
        assert!(features.validate().is_ok());
    }
}
