use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PersistenceError;
use crate::feature_encoding::task_features::{
    DEFAULT_CLARITY, DEFAULT_PHASE, DEFAULT_TASK_TYPE, MAX_RESOURCE_SLOTS,
};
use crate::feature_encoding::{ResourceAssignment, TaskAttributes, TaskFeatures};
use crate::utils::write_json_atomic;

const DEFAULT_WORKLOAD: f64 = 1.0;
const DEFAULT_EXPERIENCE: u8 = 3;
const DEFAULT_TEAM_EXPERIENCE: u8 = 3;
const DEFAULT_SIZE: u32 = 5;
const DEFAULT_COMPLEXITY: u8 = 3;
const DEFAULT_PRIORITY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub resource_id: u64,
    #[serde(default)]
    pub workload: Option<f64>,
    #[serde(default)]
    pub experience: Option<u8>,
}

/// The task fields the estimator reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: u64,
    pub project_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub complexity: Option<u8>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub assignments: Vec<AssignmentRecord>,
    /// Latest share of tasks the owning team completed, 0.0 to 1.0.
    #[serde(default)]
    pub team_completion_rate: Option<f64>,
    #[serde(default)]
    pub requirement_clarity: Option<f64>,
    /// Comma-separated keywords of the parent requirement.
    #[serde(default)]
    pub requirement_keywords: Option<String>,
    #[serde(default)]
    pub estimated_size: Option<u32>,
    #[serde(default)]
    pub estimated_duration: Option<f64>,
    #[serde(default)]
    pub actual_duration: Option<f64>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl TaskRecord {
    pub fn new(id: u64, project_id: u64) -> Self {
        TaskRecord {
            id,
            project_id,
            name: String::new(),
            complexity: None,
            priority: None,
            task_type: None,
            phase: None,
            assignments: Vec::new(),
            team_completion_rate: None,
            requirement_clarity: None,
            requirement_keywords: None,
            estimated_size: None,
            estimated_duration: None,
            actual_duration: None,
            status: TaskStatus::Pending,
            start_date: None,
            end_date: None,
        }
    }

    /// Team experience on the 1-5 scale from the completion rate.
    fn team_experience(&self) -> u8 {
        match self.team_completion_rate {
            Some(rate) if rate.is_finite() => ((rate * 5.0 + 0.5).floor() as i64).clamp(1, 5) as u8,
            _ => DEFAULT_TEAM_EXPERIENCE,
        }
    }

    fn clarity(&self) -> f64 {
        if let Some(clarity) = self.requirement_clarity {
            return clarity;
        }
        let keywords = self
            .requirement_keywords
            .as_deref()
            .map(|k| k.split(',').filter(|w| !w.trim().is_empty()).count())
            .unwrap_or(0);
        match keywords {
            n if n >= 5 => 0.9,
            n if n >= 3 => 0.8,
            _ => DEFAULT_CLARITY,
        }
    }

    /// Builds model features, filling every missing attribute with its default.
    pub fn features(&self) -> TaskFeatures {
        let resources = self
            .assignments
            .iter()
            .take(MAX_RESOURCE_SLOTS)
            .map(|a| ResourceAssignment {
                workload: a.workload.unwrap_or(DEFAULT_WORKLOAD),
                experience: a.experience.unwrap_or(DEFAULT_EXPERIENCE),
            })
            .collect();
        let mut features = TaskFeatures::new(
            self.task_type.clone().unwrap_or_else(|| DEFAULT_TASK_TYPE.to_string()),
            self.phase.clone().unwrap_or_else(|| DEFAULT_PHASE.to_string()),
        )
        .with_resources(resources);
        features.resource_count = (self.assignments.len() as u32).max(1);
        features.complexity = self.complexity.unwrap_or(DEFAULT_COMPLEXITY);
        features.priority = self.priority.unwrap_or(DEFAULT_PRIORITY);
        features.team_experience = self.team_experience();
        features.requirement_clarity = self.clarity();
        features.estimated_size = self.estimated_size.unwrap_or(DEFAULT_SIZE);
        features
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
}

/// One persisted estimate, unique per (task, model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationRecord {
    pub task_id: u64,
    pub model_name: String,
    pub model_version: String,
    pub duration_hours: f64,
    pub timestamp: DateTime<Utc>,
    pub features: TaskAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Test R² of the version, 0 when undefined.
    pub precision: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub task_id: u64,
    pub action: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScheduleUpdate {
    pub estimated_duration: Option<f64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl ScheduleUpdate {
    pub fn is_empty(&self) -> bool {
        self.estimated_duration.is_none() && self.start_date.is_none() && self.end_date.is_none()
    }
}

/// Narrow contract with the task-tracking application.
pub trait TaskStore: Send + Sync {
    fn get_task(&self, task_id: u64) -> Result<Option<TaskRecord>, PersistenceError>;

    /// Completed tasks that carry an actual duration.
    fn completed_tasks(&self) -> Result<Vec<TaskRecord>, PersistenceError>;

    fn tasks_for_project(&self, project_id: u64) -> Result<Vec<TaskRecord>, PersistenceError>;

    fn get_project(&self, project_id: u64) -> Result<Option<ProjectRecord>, PersistenceError>;

    /// Inserts or replaces the estimate for `(record.task_id, record.model_name)`.
    fn save_estimation(&self, record: EstimationRecord) -> Result<(), PersistenceError>;

    fn latest_estimation(&self, task_id: u64) -> Result<Option<EstimationRecord>, PersistenceError>;

    /// Writes the given fields onto the task, leaving `None` fields untouched.
    fn update_schedule(&self, task_id: u64, update: ScheduleUpdate) -> Result<(), PersistenceError>;

    fn record_model(&self, model: ModelRecord) -> Result<(), PersistenceError>;

    fn record_activity(&self, activity: ActivityRecord) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    tasks: BTreeMap<u64, TaskRecord>,
    #[serde(default)]
    projects: BTreeMap<u64, ProjectRecord>,
    #[serde(default)]
    estimations: Vec<EstimationRecord>,
    #[serde(default)]
    models: Vec<ModelRecord>,
    #[serde(default)]
    activity: Vec<ActivityRecord>,
}

/// In-process task store, optionally mirrored to a JSON snapshot after
/// every write.
#[derive(Debug)]
pub struct LocalTaskStore {
    state: Mutex<StoreState>,
    snapshot: Option<PathBuf>,
}

impl LocalTaskStore {
    pub fn in_memory() -> Self {
        LocalTaskStore { state: Mutex::new(StoreState::default()), snapshot: None }
    }

    /// Opens a snapshot-backed store; a missing snapshot starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|source| PersistenceError::Serialization { path: path.clone(), source })?,
            Err(e) if e.kind() == ErrorKind::NotFound => StoreState::default(),
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        tracing::info!(path = %path.display(), tasks = state.tasks.len(), "opened task store");
        Ok(LocalTaskStore { state: Mutex::new(state), snapshot: Some(path) })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &StoreState) -> Result<(), PersistenceError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| PersistenceError::Io { path: parent.to_path_buf(), source })?;
        }
        write_json_atomic(path, state)
    }

    /// Applies `change` to a copy of the state and keeps it only once the
    /// snapshot write succeeded.
    fn commit<F>(&self, change: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut StoreState) -> Result<(), PersistenceError>,
    {
        let mut state = self.lock();
        let mut next = state.clone();
        change(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    pub fn upsert_task(&self, task: TaskRecord) -> Result<(), PersistenceError> {
        self.commit(|state| {
            state.tasks.insert(task.id, task);
            Ok(())
        })
    }

    pub fn upsert_project(&self, project: ProjectRecord) -> Result<(), PersistenceError> {
        self.commit(|state| {
            state.projects.insert(project.id, project);
            Ok(())
        })
    }

    pub fn models(&self) -> Vec<ModelRecord> {
        self.lock().models.clone()
    }

    pub fn activity(&self) -> Vec<ActivityRecord> {
        self.lock().activity.clone()
    }

    pub fn estimations(&self) -> Vec<EstimationRecord> {
        self.lock().estimations.clone()
    }
}

impl TaskStore for LocalTaskStore {
    fn get_task(&self, task_id: u64) -> Result<Option<TaskRecord>, PersistenceError> {
        Ok(self.lock().tasks.get(&task_id).cloned())
    }

    fn completed_tasks(&self) -> Result<Vec<TaskRecord>, PersistenceError> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed && t.actual_duration.is_some())
            .cloned()
            .collect())
    }

    fn tasks_for_project(&self, project_id: u64) -> Result<Vec<TaskRecord>, PersistenceError> {
        Ok(self.lock().tasks.values().filter(|t| t.project_id == project_id).cloned().collect())
    }

    fn get_project(&self, project_id: u64) -> Result<Option<ProjectRecord>, PersistenceError> {
        Ok(self.lock().projects.get(&project_id).cloned())
    }

    fn save_estimation(&self, record: EstimationRecord) -> Result<(), PersistenceError> {
        self.commit(|state| {
            if !state.tasks.contains_key(&record.task_id) {
                return Err(PersistenceError::TaskNotFound(record.task_id));
            }
            let existing = state
                .estimations
                .iter_mut()
                .find(|e| e.task_id == record.task_id && e.model_name == record.model_name);
            match existing {
                Some(slot) => *slot = record,
                None => state.estimations.push(record),
            }
            Ok(())
        })
    }

    fn latest_estimation(&self, task_id: u64) -> Result<Option<EstimationRecord>, PersistenceError> {
        Ok(self
            .lock()
            .estimations
            .iter()
            .filter(|e| e.task_id == task_id)
            .max_by_key(|e| e.timestamp)
            .cloned())
    }

    fn update_schedule(&self, task_id: u64, update: ScheduleUpdate) -> Result<(), PersistenceError> {
        self.commit(|state| {
            let task = state.tasks.get_mut(&task_id).ok_or(PersistenceError::TaskNotFound(task_id))?;
            if update.estimated_duration.is_some() {
                task.estimated_duration = update.estimated_duration;
            }
            if update.start_date.is_some() {
                task.start_date = update.start_date;
            }
            if update.end_date.is_some() {
                task.end_date = update.end_date;
            }
            Ok(())
        })
    }

    fn record_model(&self, model: ModelRecord) -> Result<(), PersistenceError> {
        self.commit(|state| {
            state.models.push(model);
            Ok(())
        })
    }

    fn record_activity(&self, activity: ActivityRecord) -> Result<(), PersistenceError> {
        self.commit(|state| {
            state.activity.push(activity);
            Ok(())
        })
    }
}
