use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::errors::TrainingError;
use crate::training::dataset::LabeledTask;

#[derive(Debug, Clone, Default)]
pub struct DataSplit {
    pub train: Vec<LabeledTask>,
    pub validation: Vec<LabeledTask>,
    pub test: Vec<LabeledTask>,
}

/// Distributes `target` slots over groups proportionally to `weights`, never
/// exceeding `capacities`. Leftover slots go to the largest fractional parts.
fn allocate(target: usize, weights: &[usize], capacities: &[usize]) -> Vec<usize> {
    let total: usize = weights.iter().sum();
    if total == 0 {
        return vec![0; weights.len()];
    }
    let quotas: Vec<f64> = weights.iter().map(|&w| target as f64 * w as f64 / total as f64).collect();
    let mut counts: Vec<usize> =
        quotas.iter().zip(capacities).map(|(q, &cap)| (q.floor() as usize).min(cap)).collect();

    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|&a, &b| (quotas[b] - quotas[b].floor()).total_cmp(&(quotas[a] - quotas[a].floor())));
    let mut remaining = target.saturating_sub(counts.iter().sum());
    while remaining > 0 {
        let mut progressed = false;
        for &g in &order {
            if remaining == 0 {
                break;
            }
            if counts[g] < capacities[g] {
                counts[g] += 1;
                remaining -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    counts
}

/// Seeded train/validation/test split stratified by task type. Validation
/// and test each get at least one row.
pub fn stratified_split(
    tasks: &[LabeledTask],
    validation_fraction: f64,
    test_fraction: f64,
    seed: u64,
) -> Result<DataSplit, TrainingError> {
    let n = tasks.len();
    let n_test = ((n as f64 * test_fraction).round() as usize).max(1);
    let n_validation = ((n as f64 * validation_fraction).round() as usize).max(1);
    if n_test + n_validation >= n {
        return Err(TrainingError::InvalidDataset(format!(
            "{n} rows cannot hold {n_validation} validation and {n_test} test rows plus a training set"
        )));
    }

    let mut groups: BTreeMap<&str, Vec<&LabeledTask>> = BTreeMap::new();
    for task in tasks {
        groups.entry(task.features.task_type.as_str()).or_default().push(task);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut groups: Vec<Vec<&LabeledTask>> = groups.into_values().collect();
    for group in groups.iter_mut() {
        group.shuffle(&mut rng);
    }

    let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
    let test_counts = allocate(n_test, &sizes, &sizes);
    let left: Vec<usize> = sizes.iter().zip(&test_counts).map(|(s, t)| s - t).collect();
    let validation_counts = allocate(n_validation, &sizes, &left);

    let mut split = DataSplit::default();
    for ((group, test), validation) in groups.into_iter().zip(test_counts).zip(validation_counts) {
        let mut rows = group.into_iter().cloned();
        split.test.extend(rows.by_ref().take(test));
        split.validation.extend(rows.by_ref().take(validation));
        split.train.extend(rows);
    }
    tracing::debug!(
        train = split.train.len(),
        validation = split.validation.len(),
        test = split.test.len(),
        "dataset split"
    );
    Ok(split)
}
