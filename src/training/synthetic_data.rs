use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::feature_encoding::{ResourceAssignment, TaskFeatures};
use crate::training::dataset::LabeledTask;
use crate::utils::round2;

pub const TASK_TYPE_WEIGHTS: [(&str, f64); 7] = [
    ("Frontend", 1.2),
    ("Backend", 1.5),
    ("Database", 1.3),
    ("Testing", 1.1),
    ("Documentación", 0.9),
    ("DevOps", 1.6),
    ("Análisis", 1.4),
];

pub const PHASE_WEIGHTS: [(&str, f64); 5] = [
    ("Inicio/Conceptualización", 1.3),
    ("Elaboración/Requisitos", 1.2),
    ("Construcción/Desarrollo", 1.5),
    ("Transición/Implementación", 1.4),
    ("Mantenimiento", 1.1),
];

const STORY_POINTS: [u32; 8] = [1, 2, 3, 5, 8, 13, 21, 34];
const BASE_HOURS: f64 = 2.5;
const MIN_HOURS: f64 = 1.0;

/// Hours implied by the generator's cost model, before noise.
fn expected_hours(features: &TaskFeatures, type_weight: f64, phase_weight: f64) -> f64 {
    let productivity = features
        .resources()
        .iter()
        .map(|r| r.experience as f64 / r.workload.max(0.1))
        .sum::<f64>()
        / features.resources().len().max(1) as f64;
    let difficulty = (2.0 * features.complexity as f64 + phase_weight) / 3.0;
    let unclear = 1.0 + (1.0 - features.requirement_clarity) / 3.0;
    let team = 1.0 + features.team_experience as f64 / 10.0;
    BASE_HOURS * (features.estimated_size as f64).sqrt() * type_weight * difficulty * unclear * team
        / productivity.max(0.1)
}

/// Generates `rows` labelled tasks; the same seed gives the same rows.
pub fn generate(rows: usize, seed: u64) -> Vec<LabeledTask> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..rows)
        .map(|_| {
            let (task_type, type_weight) = TASK_TYPE_WEIGHTS[rng.random_range(0..TASK_TYPE_WEIGHTS.len())];
            let (phase, phase_weight) = PHASE_WEIGHTS[rng.random_range(0..PHASE_WEIGHTS.len())];
            let resource_count = rng.random_range(1..=3);
            let resources = (0..resource_count)
                .map(|_| ResourceAssignment {
                    workload: round2(rng.random_range(0.2..=1.0)),
                    experience: rng.random_range(1..=5),
                })
                .collect();

            let mut features = TaskFeatures::new(task_type, phase).with_resources(resources);
            features.complexity = rng.random_range(1..=5);
            features.priority = rng.random_range(1..=3);
            features.team_experience = rng.random_range(1..=5);
            features.requirement_clarity = round2(rng.random_range(0.1..=1.0));
            features.estimated_size = STORY_POINTS[rng.random_range(0..STORY_POINTS.len())];

            let noise = rng.random_range(0.85..=1.15);
            let hours = round2((expected_hours(&features, type_weight, phase_weight) * noise).max(MIN_HOURS));
            LabeledTask::new(features, hours)
        })
        .collect()
}
