use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{PersistenceError, TrainingError};
use crate::estimation::TaskStore;
use crate::feature_encoding::{TaskAttributes, TaskFeatures};
use crate::training::synthetic_data;

/// A task with its observed execution time in hours.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledTask {
    pub features: TaskFeatures,
    pub actual_duration: f64,
}

impl LabeledTask {
    pub fn new(features: TaskFeatures, actual_duration: f64) -> Self {
        LabeledTask { features, actual_duration }
    }

    fn is_usable(&self) -> bool {
        self.actual_duration.is_finite() && self.actual_duration > 0.0 && self.features.validate().is_ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_rows: usize,
    pub train_rows: usize,
    pub validation_rows: usize,
    pub test_rows: usize,
    pub skipped_rows: usize,
    pub target_mean: f64,
    pub target_std: f64,
    pub target_min: f64,
    pub target_max: f64,
    pub task_type_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    tasks: Vec<LabeledTask>,
    skipped_rows: usize,
}

impl Dataset {
    /// Keeps usable rows and counts the rest as skipped.
    pub fn new(rows: Vec<LabeledTask>, skipped_rows: usize) -> Self {
        let total = rows.len();
        let tasks: Vec<LabeledTask> = rows.into_iter().filter(LabeledTask::is_usable).collect();
        let skipped_rows = skipped_rows + (total - tasks.len());
        Dataset { tasks, skipped_rows }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[LabeledTask] {
        &self.tasks
    }

    pub fn skipped_rows(&self) -> usize {
        self.skipped_rows
    }

    pub fn features(&self) -> Vec<TaskFeatures> {
        self.tasks.iter().map(|t| t.features.clone()).collect()
    }

    pub fn targets(&self) -> Vec<f64> {
        self.tasks.iter().map(|t| t.actual_duration).collect()
    }

    /// Summary over every usable row. Split sizes are left at 0.
    pub fn stats(&self) -> DatasetStats {
        let targets = self.targets();
        let mut stats = DatasetStats { total_rows: self.len(), skipped_rows: self.skipped_rows, ..DatasetStats::default() };
        if targets.is_empty() {
            return stats;
        }
        let n = targets.len() as f64;
        stats.target_mean = targets.iter().sum::<f64>() / n;
        stats.target_std = (targets.iter().map(|t| (t - stats.target_mean).powi(2)).sum::<f64>() / n).sqrt();
        stats.target_min = targets.iter().copied().fold(f64::INFINITY, f64::min);
        stats.target_max = targets.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        for task in &self.tasks {
            *stats.task_type_counts.entry(task.features.task_type.clone()).or_default() += 1;
        }
        stats
    }
}

/// Where historical tasks come from.
pub enum DataSource<'a> {
    Csv(PathBuf),
    Json(PathBuf),
    TaskStore(&'a dyn TaskStore),
    Synthetic { rows: usize, seed: u64 },
}

/// Loads labelled tasks and fails when fewer than `min_rows` are usable.
pub fn collect_dataset(source: DataSource<'_>, min_rows: usize) -> Result<Dataset, TrainingError> {
    let dataset = match source {
        DataSource::Csv(path) => read_csv(&path)?,
        DataSource::Json(path) => read_json_rows(&path)?,
        DataSource::TaskStore(store) => {
            let rows = store
                .completed_tasks()?
                .into_iter()
                .filter_map(|task| task.actual_duration.map(|hours| LabeledTask::new(task.features(), hours)))
                .collect();
            Dataset::new(rows, 0)
        }
        DataSource::Synthetic { rows, seed } => Dataset::new(synthetic_data::generate(rows, seed), 0),
    };
    tracing::info!(rows = dataset.len(), skipped = dataset.skipped_rows(), "collected training data");
    if dataset.len() < min_rows {
        return Err(TrainingError::InsufficientData { found: dataset.len(), required: min_rows });
    }
    Ok(dataset)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Column {
    Complexity,
    Priority,
    TaskType,
    Phase,
    ResourceCount,
    WorkloadR1,
    ExperienceR1,
    WorkloadR2,
    ExperienceR2,
    WorkloadR3,
    ExperienceR3,
    TeamExperience,
    RequirementClarity,
    EstimatedSize,
    ActualDuration,
}

const REQUIRED_COLUMNS: [Column; 10] = [
    Column::Complexity,
    Column::TaskType,
    Column::Phase,
    Column::ResourceCount,
    Column::WorkloadR1,
    Column::ExperienceR1,
    Column::TeamExperience,
    Column::RequirementClarity,
    Column::EstimatedSize,
    Column::ActualDuration,
];

impl Column {
    /// Accepts the Spanish export headers as well as snake_case names.
    fn from_header(header: &str) -> Option<Column> {
        let column = match header.trim().trim_start_matches('\u{feff}') {
            "Complejidad" | "complexity" => Column::Complexity,
            "Prioridad" | "priority" => Column::Priority,
            "Tipo_Tarea" | "task_type" => Column::TaskType,
            "Fase_Tarea" | "phase" => Column::Phase,
            "Cantidad_Recursos" | "resource_count" => Column::ResourceCount,
            "Carga_Trabajo_R1" | "workload_r1" => Column::WorkloadR1,
            "Experiencia_R1" | "experience_r1" => Column::ExperienceR1,
            "Carga_Trabajo_R2" | "workload_r2" => Column::WorkloadR2,
            "Experiencia_R2" | "experience_r2" => Column::ExperienceR2,
            "Carga_Trabajo_R3" | "workload_r3" => Column::WorkloadR3,
            "Experiencia_R3" | "experience_r3" => Column::ExperienceR3,
            "Experiencia_Equipo" | "team_experience" => Column::TeamExperience,
            "Claridad_Requisitos" | "requirement_clarity" => Column::RequirementClarity,
            "Tamaño_Tarea" | "TamaÃ±o_Tarea" | "estimated_size" => Column::EstimatedSize,
            "Tiempo_Ejecucion" | "actual_duration" => Column::ActualDuration,
            _ => return None,
        };
        Some(column)
    }
}

/// Splits one CSV line, honouring double-quoted fields.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

struct CsvRow<'a> {
    fields: &'a [String],
    columns: &'a BTreeMap<Column, usize>,
}

impl CsvRow<'_> {
    fn raw(&self, column: Column) -> Option<&str> {
        self.columns
            .get(&column)
            .and_then(|&i| self.fields.get(i))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, column: Column) -> Result<f64, String> {
        let raw = self.raw(column).ok_or_else(|| format!("{column:?} is empty"))?;
        raw.parse::<f64>().map_err(|e| format!("{column:?}='{raw}': {e}"))
    }

    fn optional(&self, column: Column) -> Result<f64, String> {
        match self.raw(column) {
            Some(raw) => raw.parse::<f64>().map_err(|e| format!("{column:?}='{raw}': {e}")),
            None => Ok(0.0),
        }
    }

    fn text(&self, column: Column) -> Result<String, String> {
        self.raw(column).map(str::to_string).ok_or_else(|| format!("{column:?} is empty"))
    }

    /// Task attributes of the row. Empty resource cells count as 0.
    fn attributes(&self) -> Result<TaskAttributes, String> {
        let small = |v: f64| v.round().clamp(0.0, u8::MAX as f64) as u8;
        let attributes = TaskAttributes {
            complexity: small(self.required(Column::Complexity)?),
            priority: match self.raw(Column::Priority) {
                Some(_) => small(self.optional(Column::Priority)?),
                None => TaskAttributes::default().priority,
            },
            task_type: self.text(Column::TaskType)?,
            phase: self.text(Column::Phase)?,
            resource_count: self.required(Column::ResourceCount)?.round().max(0.0) as u32,
            workload_r1: self.optional(Column::WorkloadR1)?,
            experience_r1: small(self.optional(Column::ExperienceR1)?),
            workload_r2: self.optional(Column::WorkloadR2)?,
            experience_r2: small(self.optional(Column::ExperienceR2)?),
            workload_r3: self.optional(Column::WorkloadR3)?,
            experience_r3: small(self.optional(Column::ExperienceR3)?),
            team_experience: small(self.required(Column::TeamExperience)?),
            requirement_clarity: self.required(Column::RequirementClarity)?,
            estimated_size: self.required(Column::EstimatedSize)?.round().max(0.0) as u32,
        };
        Ok(attributes)
    }

    fn to_labeled(&self) -> Result<LabeledTask, String> {
        let attributes = self.attributes()?;
        Ok(LabeledTask::new(TaskFeatures::from(attributes), self.required(Column::ActualDuration)?))
    }
}

/// Header mapping and raw fields of a CSV file. Lines that are not valid
/// UTF-8 are counted in `unreadable` instead of failing the file.
struct CsvTable {
    columns: BTreeMap<Column, usize>,
    lines: Vec<(usize, Vec<String>)>,
    unreadable: usize,
}

impl CsvTable {
    fn read(path: &Path, required: &[Column]) -> Result<CsvTable, TrainingError> {
        let io_err = |source| PersistenceError::Io { path: path.to_path_buf(), source };
        let file = File::open(path).map_err(io_err)?;
        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();

        if reader.read_until(b'\n', &mut buffer).map_err(io_err)? == 0 {
            return Err(TrainingError::InvalidDataset(format!("{} is empty", path.display())));
        }
        let header = String::from_utf8_lossy(&buffer).into_owned();
        let columns: BTreeMap<Column, usize> = split_csv_line(header.trim_end_matches(['\r', '\n']))
            .iter()
            .enumerate()
            .filter_map(|(i, name)| Column::from_header(name).map(|c| (c, i)))
            .collect();
        let missing: Vec<String> =
            required.iter().filter(|c| !columns.contains_key(*c)).map(|c| format!("{c:?}")).collect();
        if !missing.is_empty() {
            return Err(TrainingError::InvalidDataset(format!(
                "{} lacks required columns: {}",
                path.display(),
                missing.join(", ")
            )));
        }

        let mut lines = Vec::new();
        let mut unreadable = 0;
        let mut line_number = 1;
        loop {
            buffer.clear();
            if reader.read_until(b'\n', &mut buffer).map_err(io_err)? == 0 {
                break;
            }
            line_number += 1;
            let Ok(line) = std::str::from_utf8(&buffer) else {
                tracing::debug!(line = line_number, "skipping csv line that is not utf-8");
                unreadable += 1;
                continue;
            };
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                continue;
            }
            lines.push((line_number, split_csv_line(line)));
        }
        Ok(CsvTable { columns, lines, unreadable })
    }

    fn rows(&self) -> impl Iterator<Item = (usize, CsvRow<'_>)> {
        self.lines.iter().map(|(line_number, fields)| (*line_number, CsvRow { fields, columns: &self.columns }))
    }
}

fn read_csv(path: &Path) -> Result<Dataset, TrainingError> {
    let table = CsvTable::read(path, &REQUIRED_COLUMNS)?;
    let mut rows = Vec::new();
    let mut skipped = table.unreadable;
    for (line_number, row) in table.rows() {
        match row.to_labeled() {
            Ok(task) => rows.push(task),
            Err(reason) => {
                tracing::debug!(line = line_number, %reason, "skipping csv row");
                skipped += 1;
            }
        }
    }
    Ok(Dataset::new(rows, skipped))
}

/// One row of an unlabelled task file.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvTask {
    /// 0-based index among the file's data lines.
    pub row: usize,
    pub attributes: TaskAttributes,
}

/// Reads task attributes from a CSV with the training headers. The duration
/// column is not needed. Returns the parsed tasks and the number of rows
/// that could not be read.
pub fn read_task_csv(path: &Path) -> Result<(Vec<CsvTask>, usize), TrainingError> {
    let table = CsvTable::read(path, &REQUIRED_COLUMNS[..REQUIRED_COLUMNS.len() - 1])?;
    let mut tasks = Vec::new();
    let mut skipped = table.unreadable;
    for (row, (line_number, csv_row)) in table.rows().enumerate() {
        match csv_row.attributes() {
            Ok(attributes) => tasks.push(CsvTask { row, attributes }),
            Err(reason) => {
                tracing::debug!(line = line_number, %reason, "skipping csv row");
                skipped += 1;
            }
        }
    }
    Ok((tasks, skipped))
}

#[derive(Deserialize)]
struct LabeledRow {
    #[serde(flatten)]
    attributes: TaskAttributes,
    actual_duration: Option<f64>,
}

fn read_json_rows(path: &Path) -> Result<Dataset, TrainingError> {
    let file = File::open(path).map_err(|source| PersistenceError::Io { path: path.to_path_buf(), source })?;
    let rows: Vec<LabeledRow> = serde_json::from_reader(BufReader::new(file))
        .map_err(|source| PersistenceError::Serialization { path: path.to_path_buf(), source })?;
    let total = rows.len();
    let labeled: Vec<LabeledTask> = rows
        .into_iter()
        .filter_map(|row| row.actual_duration.map(|hours| LabeledTask::new(TaskFeatures::from(row.attributes), hours)))
        .collect();
    let unlabeled = total - labeled.len();
    Ok(Dataset::new(labeled, unlabeled))
}
