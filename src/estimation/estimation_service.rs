use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::duration_model::MIN_DURATION_HOURS;
use crate::errors::{ArtifactLoadError, EstimationError, PersistenceError};
use crate::estimation::task_store::{
    ActivityRecord, EstimationRecord, ScheduleUpdate, TaskRecord, TaskStatus, TaskStore,
};
use crate::feature_encoding::{TaskAttributes, TaskFeatures};
use crate::training::{ArtifactStore, TrainedArtifact};
use crate::utils::round2;

const WORKING_HOURS_PER_DAY: f64 = 8.0;
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Calendar days a duration spans at eight working hours a day, at least one.
fn working_days(hours: f64) -> u64 {
    (hours / WORKING_HOURS_PER_DAY).round_ties_even().max(1.0) as u64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationResult {
    pub duration_hours: f64,
    pub model_name: String,
    pub model_version: String,
    /// Test R² of the model version, clamped to `[0, 1]`.
    pub confidence: f64,
}

/// The published artifact shared by every request in the process.
///
/// The artifact is loaded lazily, outside the lock, and swapped in whole, so
/// readers always hold a complete version. `CURRENT` is re-read at most once
/// per refresh interval, so a version promoted by another process is served
/// within that window.
#[derive(Debug)]
pub struct EstimationContext {
    artifacts: ArtifactStore,
    model_name: String,
    current: RwLock<Option<Arc<TrainedArtifact>>>,
    refresh_interval: Duration,
    last_check: Mutex<Option<Instant>>,
}

impl EstimationContext {
    pub fn new(artifacts: ArtifactStore, model_name: impl Into<String>) -> Self {
        EstimationContext {
            artifacts,
            model_name: model_name.into(),
            current: RwLock::new(None),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            last_check: Mutex::new(None),
        }
    }

    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn loaded_version(&self) -> Option<String> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current.as_ref().map(|a| a.version().to_string())
    }

    fn current(&self) -> Option<Arc<TrainedArtifact>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Claims the next `CURRENT` check when the interval has passed.
    fn refresh_due(&self) -> bool {
        let mut last_check = self.last_check.lock().unwrap_or_else(PoisonError::into_inner);
        match *last_check {
            Some(at) if at.elapsed() < self.refresh_interval => false,
            _ => {
                *last_check = Some(Instant::now());
                true
            }
        }
    }

    pub fn artifact(&self) -> Result<Arc<TrainedArtifact>, ArtifactLoadError> {
        let Some(artifact) = self.current() else {
            let loaded = Arc::new(self.artifacts.load_current()?);
            tracing::info!(version = loaded.version(), "artifact loaded");
            *self.last_check.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            return Ok(Arc::clone(current.get_or_insert(loaded)));
        };
        if !self.refresh_due() {
            return Ok(artifact);
        }
        match self.refresh() {
            Ok(true) => Ok(self.current().unwrap_or(artifact)),
            Ok(false) => Ok(artifact),
            Err(e) => {
                tracing::warn!(version = artifact.version(), error = %e, "refresh failed, keeping loaded artifact");
                Ok(artifact)
            }
        }
    }

    /// Reloads when `CURRENT` names a version other than the loaded one.
    /// Returns whether a new version was swapped in.
    pub fn refresh(&self) -> Result<bool, ArtifactLoadError> {
        let Some(version) = self.artifacts.current_version()? else {
            return Err(ArtifactLoadError::NothingPublished { dir: self.artifacts.root().to_path_buf() });
        };
        if self.loaded_version().as_deref() == Some(version.as_str()) {
            return Ok(false);
        }
        let loaded = self.artifacts.load_version(&version)?;
        self.publish(Arc::new(loaded));
        Ok(true)
    }

    pub fn publish(&self, artifact: Arc<TrainedArtifact>) {
        tracing::info!(version = artifact.version(), "artifact published to estimation context");
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(artifact);
    }

    pub fn estimate(&self, features: &TaskFeatures) -> Result<EstimationResult, EstimationError> {
        let artifact = self.artifact()?;
        let hours = artifact.estimate_hours(features)?;
        Ok(EstimationResult {
            duration_hours: round2(hours).max(MIN_DURATION_HOURS),
            model_name: self.model_name.clone(),
            model_version: artifact.version().to_string(),
            confidence: artifact.confidence(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationOutcome {
    pub success: bool,
    pub duration_hours: Option<f64>,
    pub message: String,
}

impl EstimationOutcome {
    fn failed(duration_hours: Option<f64>, message: String) -> Self {
        EstimationOutcome { success: false, duration_hours, message }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReestimationOutcome {
    pub success: bool,
    pub previous_hours: f64,
    pub new_hours: Option<f64>,
    pub difference_hours: Option<f64>,
    pub difference_percent: Option<f64>,
    pub estimated_at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEstimate {
    pub project_id: u64,
    pub project_name: String,
    pub total_tasks: usize,
    pub estimated_tasks: usize,
    pub completed_tasks: usize,
    pub estimated_hours: f64,
    pub actual_hours: f64,
    pub completion_percent: f64,
    pub start_date: Option<NaiveDate>,
    pub estimated_end_date: Option<NaiveDate>,
}

/// Estimation entry points that read from and write back to the task store.
/// None of them return an error for a single task; failures become outcomes.
#[derive(Clone)]
pub struct EstimationService {
    context: Arc<EstimationContext>,
    store: Arc<dyn TaskStore>,
}

impl EstimationService {
    pub fn new(context: Arc<EstimationContext>, store: Arc<dyn TaskStore>) -> Self {
        EstimationService { context, store }
    }

    pub fn context(&self) -> &Arc<EstimationContext> {
        &self.context
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Estimates raw attributes without touching the store.
    pub fn estimate_attributes(&self, attributes: TaskAttributes) -> Result<EstimationResult, EstimationError> {
        self.context.estimate(&TaskFeatures::from(attributes))
    }

    fn estimate_task(&self, task_id: u64) -> Result<(TaskRecord, TaskFeatures, EstimationResult), EstimationError> {
        let task = self.store.get_task(task_id)?.ok_or(EstimationError::TaskNotFound(task_id))?;
        let features = task.features();
        let result = self.context.estimate(&features)?;
        Ok((task, features, result))
    }

    /// Saves the estimate and fills the task's duration and dates where unset.
    fn save(&self, task: &TaskRecord, features: &TaskFeatures, result: &EstimationResult) -> Result<(), PersistenceError> {
        self.store.save_estimation(EstimationRecord {
            task_id: task.id,
            model_name: result.model_name.clone(),
            model_version: result.model_version.clone(),
            duration_hours: result.duration_hours,
            timestamp: Utc::now(),
            features: TaskAttributes::from(features),
        })?;

        let start = task.start_date.unwrap_or_else(|| Utc::now().date_naive());
        let update = ScheduleUpdate {
            estimated_duration: task.estimated_duration.is_none().then_some(result.duration_hours),
            start_date: task.start_date.is_none().then_some(start),
            end_date: task
                .end_date
                .is_none()
                .then(|| start.checked_add_days(Days::new(working_days(result.duration_hours))))
                .flatten(),
        };
        if !update.is_empty() {
            self.store.update_schedule(task.id, update)?;
        }
        Ok(())
    }

    fn log_activity(&self, task_id: u64, action: &str, detail: String) {
        let activity = ActivityRecord { task_id, action: action.to_string(), detail, timestamp: Utc::now() };
        if let Err(e) = self.store.record_activity(activity) {
            tracing::warn!(task_id, action, error = %e, "failed to record activity");
        }
    }

    pub fn estimate_and_save(&self, task_id: u64) -> EstimationOutcome {
        let (task, features, result) = match self.estimate_task(task_id) {
            Ok(estimated) => estimated,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "estimation failed");
                return EstimationOutcome::failed(None, e.to_string());
            }
        };
        let hours = result.duration_hours;
        if let Err(e) = self.save(&task, &features, &result) {
            tracing::error!(task_id, error = %e, "estimate computed but not saved");
            return EstimationOutcome::failed(Some(hours), format!("task {task_id} estimated at {hours} h but not saved: {e}"));
        }
        self.log_activity(
            task_id,
            "estimated",
            format!("{hours} h by {} {}", result.model_name, result.model_version),
        );
        tracing::info!(task_id, hours, version = %result.model_version, "task estimated");
        EstimationOutcome {
            success: true,
            duration_hours: Some(hours),
            message: format!("task {task_id} estimated at {hours} h and saved"),
        }
    }

    /// Compares a fresh estimate against the latest stored one, then saves it.
    pub fn reestimate(&self, task_id: u64) -> ReestimationOutcome {
        let estimated_at = Utc::now();
        let failed = |previous_hours: f64, new_hours: Option<f64>, message: String| ReestimationOutcome {
            success: false,
            previous_hours,
            new_hours,
            difference_hours: None,
            difference_percent: None,
            estimated_at,
            message,
        };

        let previous = match self.store.latest_estimation(task_id) {
            Ok(latest) => latest.map(|e| e.duration_hours).unwrap_or(0.0),
            Err(e) => return failed(0.0, None, e.to_string()),
        };
        let (task, features, result) = match self.estimate_task(task_id) {
            Ok(estimated) => estimated,
            Err(e) => return failed(previous, None, e.to_string()),
        };
        let new_hours = result.duration_hours;
        let difference = round2(new_hours - previous);
        let percent = if previous > 0.0 { round2((new_hours - previous) / previous * 100.0) } else { 100.0 };

        if let Err(e) = self.save(&task, &features, &result) {
            return failed(previous, Some(new_hours), format!("re-estimate for task {task_id} not saved: {e}"));
        }
        self.log_activity(task_id, "reestimated", format!("{previous} h -> {new_hours} h ({percent:+}%)"));
        ReestimationOutcome {
            success: true,
            previous_hours: previous,
            new_hours: Some(new_hours),
            difference_hours: Some(difference),
            difference_percent: Some(percent),
            estimated_at,
            message: format!("task {task_id} re-estimated"),
        }
    }

    pub fn estimate_project_completion(&self, project_id: u64) -> Result<ProjectEstimate, EstimationError> {
        let project = self.store.get_project(project_id)?.ok_or(EstimationError::ProjectNotFound(project_id))?;
        let tasks = self.store.tasks_for_project(project_id)?;

        let estimated_hours: f64 = tasks.iter().filter_map(|t| t.estimated_duration).sum();
        let actual_hours: f64 = tasks.iter().filter_map(|t| t.actual_duration).sum();
        let completed_tasks = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
        let completion_percent =
            if tasks.is_empty() { 0.0 } else { round2(completed_tasks as f64 / tasks.len() as f64 * 100.0) };
        let estimated_end_date =
            project.start_date.and_then(|start| start.checked_add_days(Days::new(working_days(estimated_hours))));

        Ok(ProjectEstimate {
            project_id,
            project_name: project.name,
            total_tasks: tasks.len(),
            estimated_tasks: tasks.iter().filter(|t| t.estimated_duration.is_some()).count(),
            completed_tasks,
            estimated_hours: round2(estimated_hours),
            actual_hours: round2(actual_hours),
            completion_percent,
            start_date: project.start_date,
            estimated_end_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::task_store::{AssignmentRecord, LocalTaskStore, ModelRecord, ProjectRecord};
    use crate::training::artifact_store::tests::tiny_artifact;

    fn published_context(dir: &std::path::Path) -> Arc<EstimationContext> {
        let artifacts = ArtifactStore::new(dir);
        artifacts.write_version(&tiny_artifact("v1")).unwrap();
        artifacts.promote("v1").unwrap();
        Arc::new(EstimationContext::new(artifacts, "rnn_duration_estimator"))
    }

    fn backend_task(id: u64) -> TaskRecord {
        let mut task = TaskRecord::new(id, 1);
        task.task_type = Some("Backend".to_string());
        task.phase = Some("Construcción/Desarrollo".to_string());
        task.complexity = Some(3);
        task.estimated_size = Some(5);
        task.team_completion_rate = Some(0.6);
        task.assignments = vec![
            AssignmentRecord { resource_id: 1, workload: Some(0.5), experience: Some(4) },
            AssignmentRecord { resource_id: 2, workload: Some(0.3), experience: Some(3) },
        ];
        task
    }

    /// Delegates to a local store but fails the chosen writes.
    struct FlakyStore {
        inner: LocalTaskStore,
        fail_estimations: bool,
        fail_activity: bool,
    }

    impl TaskStore for FlakyStore {
        fn get_task(&self, task_id: u64) -> Result<Option<TaskRecord>, PersistenceError> {
            self.inner.get_task(task_id)
        }
        fn completed_tasks(&self) -> Result<Vec<TaskRecord>, PersistenceError> {
            self.inner.completed_tasks()
        }
        fn tasks_for_project(&self, project_id: u64) -> Result<Vec<TaskRecord>, PersistenceError> {
            self.inner.tasks_for_project(project_id)
        }
        fn get_project(&self, project_id: u64) -> Result<Option<ProjectRecord>, PersistenceError> {
            self.inner.get_project(project_id)
        }
        fn save_estimation(&self, record: EstimationRecord) -> Result<(), PersistenceError> {
            if self.fail_estimations {
                return Err(PersistenceError::Unavailable("estimation table locked".to_string()));
            }
            self.inner.save_estimation(record)
        }
        fn latest_estimation(&self, task_id: u64) -> Result<Option<EstimationRecord>, PersistenceError> {
            self.inner.latest_estimation(task_id)
        }
        fn update_schedule(&self, task_id: u64, update: ScheduleUpdate) -> Result<(), PersistenceError> {
            self.inner.update_schedule(task_id, update)
        }
        fn record_model(&self, model: ModelRecord) -> Result<(), PersistenceError> {
            self.inner.record_model(model)
        }
        fn record_activity(&self, activity: ActivityRecord) -> Result<(), PersistenceError> {
            if self.fail_activity {
                return Err(PersistenceError::Unavailable("activity log offline".to_string()));
            }
            self.inner.record_activity(activity)
        }
    }

    #[test]
    fn test_backend_task_is_estimated_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalTaskStore::in_memory());
        store.upsert_task(backend_task(1)).unwrap();
        let service = EstimationService::new(published_context(dir.path()), store.clone());

        let outcome = service.estimate_and_save(1);
        assert!(outcome.success, "{}", outcome.message);
        let hours = outcome.duration_hours.unwrap();
        assert!(hours >= 1.0);

        let saved = store.latest_estimation(1).unwrap().unwrap();
        assert_eq!(saved.duration_hours, hours);
        assert_eq!(saved.model_version, "v1");
        let task = store.get_task(1).unwrap().unwrap();
        assert_eq!(task.estimated_duration, Some(hours));
        let start = task.start_date.unwrap();
        assert_eq!(task.end_date, start.checked_add_days(Days::new(working_days(hours))));
        assert_eq!(store.activity().len(), 1);
    }

    #[test]
    fn test_existing_duration_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalTaskStore::in_memory());
        let mut task = backend_task(1);
        task.estimated_duration = Some(99.0);
        store.upsert_task(task).unwrap();
        let service = EstimationService::new(published_context(dir.path()), store.clone());

        assert!(service.estimate_and_save(1).success);
        assert_eq!(store.get_task(1).unwrap().unwrap().estimated_duration, Some(99.0));
    }

    #[test]
    fn test_estimate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let context = published_context(dir.path());
        let features = backend_task(1).features();
        assert_eq!(context.estimate(&features).unwrap(), context.estimate(&features).unwrap());
    }

    #[test]
    fn test_unseen_task_type_still_estimates() {
        let dir = tempfile::tempdir().unwrap();
        let context = published_context(dir.path());
        let mut task = backend_task(1);
        task.task_type = Some("Quantum Computing".to_string());
        let result = context.estimate(&task.features()).unwrap();
        assert!(result.duration_hours >= 1.0);
        assert!((0.0..=1.0).contains(&result.confidence));
    }

    #[test]
    fn test_missing_task_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let service = EstimationService::new(published_context(dir.path()), Arc::new(LocalTaskStore::in_memory()));
        let outcome = service.estimate_and_save(42);
        assert_eq!(outcome, EstimationOutcome { success: false, duration_hours: None, message: "task 42 not found".to_string() });
    }

    #[test]
    fn test_nothing_published_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalTaskStore::in_memory());
        store.upsert_task(backend_task(1)).unwrap();
        let context = Arc::new(EstimationContext::new(ArtifactStore::new(dir.path()), "rnn"));
        let outcome = EstimationService::new(context, store).estimate_and_save(1);
        assert!(!outcome.success);
        assert_eq!(outcome.duration_hours, None);
    }

    #[test]
    fn test_persistence_failure_keeps_duration() {
        let dir = tempfile::tempdir().unwrap();
        let inner = LocalTaskStore::in_memory();
        inner.upsert_task(backend_task(1)).unwrap();
        let store = Arc::new(FlakyStore { inner, fail_estimations: true, fail_activity: false });
        let outcome = EstimationService::new(published_context(dir.path()), store).estimate_and_save(1);
        assert!(!outcome.success);
        assert!(outcome.duration_hours.is_some());
        assert!(outcome.message.contains("not saved"));
    }

    #[test]
    fn test_activity_failure_does_not_fail_estimation() {
        let dir = tempfile::tempdir().unwrap();
        let inner = LocalTaskStore::in_memory();
        inner.upsert_task(backend_task(1)).unwrap();
        let store = Arc::new(FlakyStore { inner, fail_estimations: false, fail_activity: true });
        let outcome = EstimationService::new(published_context(dir.path()), store).estimate_and_save(1);
        assert!(outcome.success);
    }

    #[test]
    fn test_reestimate_reports_difference() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalTaskStore::in_memory());
        store.upsert_task(backend_task(1)).unwrap();
        let service = EstimationService::new(published_context(dir.path()), store);

        let first = service.reestimate(1);
        assert!(first.success);
        assert_eq!(first.previous_hours, 0.0);
        assert_eq!(first.difference_percent, Some(100.0));

        let second = service.reestimate(1);
        assert_eq!(second.previous_hours, first.new_hours.unwrap());
        assert_eq!(second.difference_hours, Some(0.0));
        assert_eq!(second.difference_percent, Some(0.0));

        assert!(!service.reestimate(77).success);
    }

    #[test]
    fn test_project_completion_totals() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalTaskStore::in_memory());
        let start = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        store.upsert_project(ProjectRecord { id: 5, name: "Portal".to_string(), start_date: Some(start) }).unwrap();
        let hours = [Some(8.0), Some(16.0), None];
        for (id, estimated) in hours.into_iter().enumerate() {
            let mut task = TaskRecord::new(id as u64, 5);
            task.estimated_duration = estimated;
            if id == 0 {
                task.status = TaskStatus::Completed;
                task.actual_duration = Some(10.0);
            }
            store.upsert_task(task).unwrap();
        }
        let service = EstimationService::new(published_context(dir.path()), store);

        let estimate = service.estimate_project_completion(5).unwrap();
        assert_eq!(estimate.total_tasks, 3);
        assert_eq!(estimate.estimated_tasks, 2);
        assert_eq!(estimate.completed_tasks, 1);
        assert_eq!(estimate.estimated_hours, 24.0);
        assert_eq!(estimate.actual_hours, 10.0);
        assert_eq!(estimate.completion_percent, 33.33);
        assert_eq!(estimate.estimated_end_date, NaiveDate::from_ymd_opt(2026, 3, 5));
        assert!(matches!(service.estimate_project_completion(6), Err(EstimationError::ProjectNotFound(6))));
    }

    #[test]
    fn test_refresh_swaps_in_promoted_version() {
        let dir = tempfile::tempdir().unwrap();
        let context = published_context(dir.path());
        assert_eq!(context.artifact().unwrap().version(), "v1");
        assert!(!context.refresh().unwrap());

        context.artifacts().write_version(&tiny_artifact("v2")).unwrap();
        context.artifacts().promote("v2").unwrap();
        assert_eq!(context.loaded_version().as_deref(), Some("v1"));
        assert!(context.refresh().unwrap());
        assert_eq!(context.loaded_version().as_deref(), Some("v2"));
    }

    #[test]
    fn test_promoted_version_is_served_after_interval() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path());
        artifacts.write_version(&tiny_artifact("v1")).unwrap();
        artifacts.promote("v1").unwrap();
        let context = EstimationContext::new(artifacts, "rnn").with_refresh_interval(Duration::from_millis(20));
        let features = backend_task(1).features();
        assert_eq!(context.estimate(&features).unwrap().model_version, "v1");

        let other_process = ArtifactStore::new(dir.path());
        other_process.write_version(&tiny_artifact("v2")).unwrap();
        other_process.promote("v2").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(context.estimate(&features).unwrap().model_version, "v2");
    }

    #[test]
    fn test_loaded_version_kept_within_interval() {
        let dir = tempfile::tempdir().unwrap();
        let context = published_context(dir.path());
        let features = backend_task(1).features();
        assert_eq!(context.estimate(&features).unwrap().model_version, "v1");

        context.artifacts().write_version(&tiny_artifact("v2")).unwrap();
        context.artifacts().promote("v2").unwrap();
        assert_eq!(context.estimate(&features).unwrap().model_version, "v1");
    }

    #[test]
    fn test_readers_only_see_complete_versions() {
        let dir = tempfile::tempdir().unwrap();
        let context = published_context(dir.path());
        let v2 = Arc::new(tiny_artifact("v2"));
        let features = backend_task(1).features();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        let result = context.estimate(&features).unwrap();
                        assert!(result.model_version == "v1" || result.model_version == "v2");
                    }
                });
            }
            scope.spawn(|| context.publish(Arc::clone(&v2)));
        });
        assert_eq!(context.loaded_version().as_deref(), Some("v2"));
    }

    #[test]
    fn test_working_days_rounding() {
        assert_eq!(working_days(2.0), 1);
        assert_eq!(working_days(12.0), 2);
        assert_eq!(working_days(20.0), 2);
        assert_eq!(working_days(28.0), 4);
    }
}
