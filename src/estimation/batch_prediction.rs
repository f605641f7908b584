use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::EstimationError;
use crate::estimation::EstimationContext;
use crate::feature_encoding::{TaskAttributes, TaskFeatures};
use crate::training::dataset::{CsvTask, read_task_csv};
use crate::utils::{round2, write_text_atomic};

const OUTPUT_HEADER: [&str; 16] = [
    "id",
    "estimated_duration",
    "complexity",
    "priority",
    "task_type",
    "phase",
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

/// Spread of the durations written by [`predict_csv`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSummary {
    pub model_version: String,
    pub predicted: usize,
    pub skipped: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl PredictionSummary {
    fn new(model_version: String, mut hours: Vec<f64>, skipped: usize) -> Self {
        hours.sort_by(f64::total_cmp);
        let n = hours.len();
        let (mean, median) = match n {
            0 => (0.0, 0.0),
            _ if n % 2 == 1 => (hours.iter().sum::<f64>() / n as f64, hours[n / 2]),
            _ => (hours.iter().sum::<f64>() / n as f64, (hours[n / 2 - 1] + hours[n / 2]) / 2.0),
        };
        PredictionSummary {
            model_version,
            predicted: n,
            skipped,
            mean: round2(mean),
            median: round2(median),
            min: hours.first().copied().unwrap_or(0.0),
            max: hours.last().copied().unwrap_or(0.0),
        }
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn output_line(row: usize, hours: f64, a: &TaskAttributes) -> String {
    [
        row.to_string(),
        hours.to_string(),
        a.complexity.to_string(),
        a.priority.to_string(),
        csv_escape(&a.task_type),
        csv_escape(&a.phase),
        a.resource_count.to_string(),
        a.workload_r1.to_string(),
        a.experience_r1.to_string(),
        a.workload_r2.to_string(),
        a.experience_r2.to_string(),
        a.workload_r3.to_string(),
        a.experience_r3.to_string(),
        a.team_experience.to_string(),
        a.requirement_clarity.to_string(),
        a.estimated_size.to_string(),
    ]
    .join(",")
}

/// Estimates every task of `input` and writes them, with an
/// `estimated_duration` column, to `output`. Rows that cannot be read or
/// encoded are counted as skipped. Fails only when the file itself is
/// unusable or no model is published.
pub fn predict_csv(context: &EstimationContext, input: &Path, output: &Path) -> Result<PredictionSummary, EstimationError> {
    let artifact = context.artifact()?;
    let (tasks, mut skipped) = read_task_csv(input)?;

    let mut lines = vec![OUTPUT_HEADER.join(",")];
    let mut hours = Vec::with_capacity(tasks.len());
    for CsvTask { row, attributes } in tasks {
        match context.estimate(&TaskFeatures::from(attributes.clone())) {
            Ok(result) => {
                lines.push(output_line(row, result.duration_hours, &attributes));
                hours.push(result.duration_hours);
            }
            Err(e) => {
                tracing::debug!(row, error = %e, "skipping task that cannot be estimated");
                skipped += 1;
            }
        }
    }
    lines.push(String::new());
    write_text_atomic(output, &lines.join("\n"))?;

    let summary = PredictionSummary::new(artifact.version().to_string(), hours, skipped);
    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        predicted = summary.predicted,
        skipped = summary.skipped,
        "batch prediction written"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::ArtifactStore;
    use crate::training::artifact_store::tests::tiny_artifact;

    fn published_context(dir: &Path) -> EstimationContext {
        let artifacts = ArtifactStore::new(dir.join("models"));
        artifacts.write_version(&tiny_artifact("v1")).unwrap();
        artifacts.promote("v1").unwrap();
        EstimationContext::new(artifacts, "rnn")
    }

    #[test]
    fn test_predictions_written_next_to_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let context = published_context(dir.path());
        let input = dir.path().join("pending.csv");
        std::fs::write(
            &input,
            "Complejidad,Tipo_Tarea,Fase_Tarea,Cantidad_Recursos,Carga_Trabajo_R1,Experiencia_R1,Experiencia_Equipo,Claridad_Requisitos,Tamaño_Tarea\n\
             3,Backend,Construcción/Desarrollo,1,0.5,4,3,0.8,5\n\
             9,Backend,Construcción/Desarrollo,1,0.5,4,3,0.8,5\n\
             2,\"Front, web\",Mantenimiento,1,0.2,2,4,0.6,3\n",
        )
        .unwrap();
        let output = dir.path().join("predictions.csv");

        let summary = predict_csv(&context, &input, &output).unwrap();
        assert_eq!(summary.model_version, "v1");
        assert_eq!(summary.predicted, 2);
        assert_eq!(summary.skipped, 1);
        assert!(summary.min >= 1.0);
        assert!(summary.min <= summary.median && summary.median <= summary.max);

        let written = std::fs::read_to_string(&output).unwrap();
        assert!(written.starts_with("id,estimated_duration,complexity"));
        let (rows, unreadable) = read_task_csv(&output).unwrap();
        assert_eq!(unreadable, 0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].attributes.task_type, "Front, web");
        assert_eq!(rows[1].attributes.estimated_size, 3);
    }

    #[test]
    fn test_nothing_published_fails_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let context = EstimationContext::new(ArtifactStore::new(dir.path().join("models")), "rnn");
        let input = dir.path().join("pending.csv");
        std::fs::write(&input, "complexity\n3\n").unwrap();
        let output = dir.path().join("predictions.csv");

        assert!(matches!(predict_csv(&context, &input, &output), Err(EstimationError::ArtifactLoad(_))));
        assert!(!output.exists());
    }

    #[test]
    fn test_summary_statistics() {
        let summary = PredictionSummary::new("v3".to_string(), vec![8.0, 2.0, 4.0, 10.0], 0);
        assert_eq!((summary.mean, summary.median, summary.min, summary.max), (6.0, 6.0, 2.0, 10.0));
        let empty = PredictionSummary::new("v3".to_string(), Vec::new(), 2);
        assert_eq!((empty.predicted, empty.mean), (0, 0.0));
    }
}
