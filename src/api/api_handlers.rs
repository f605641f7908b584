use std::sync::Arc;

use actix_web::{HttpResponse, Responder, web};

use crate::api::api_objects::{AppState, ErrorResponse, ReloadResponse, RetrainResponse};
use crate::errors::{ArtifactLoadError, EstimationError, TrainingError};
use crate::feature_encoding::TaskAttributes;
use crate::training::retrain;

pub async fn handle_estimate(attributes: web::Json<TaskAttributes>, state: web::Data<AppState>) -> impl Responder {
    let service = state.service.clone();
    let estimated = web::block(move || service.estimate_attributes(attributes.into_inner())).await;
    match estimated {
        Ok(Ok(result)) => HttpResponse::Ok().json(result),
        Ok(Err(e @ EstimationError::Encoding(_))) => HttpResponse::BadRequest().json(ErrorResponse::new(e)),
        Ok(Err(e @ EstimationError::ArtifactLoad(_))) => {
            tracing::warn!(error = %e, "no model available for estimate");
            HttpResponse::ServiceUnavailable().json(ErrorResponse::new(e))
        }
        Ok(Err(e)) => HttpResponse::InternalServerError().json(ErrorResponse::new(e)),
        Err(e) => HttpResponse::InternalServerError().json(ErrorResponse::new(e)),
    }
}

pub async fn handle_estimate_task(path: web::Path<u64>, state: web::Data<AppState>) -> impl Responder {
    let task_id = path.into_inner();
    let service = state.service.clone();
    match web::block(move || service.estimate_and_save(task_id)).await {
        Ok(outcome) if outcome.success => HttpResponse::Ok().json(outcome),
        Ok(outcome) => HttpResponse::UnprocessableEntity().json(outcome),
        Err(e) => HttpResponse::InternalServerError().json(ErrorResponse::new(e)),
    }
}

pub async fn handle_reestimate_task(path: web::Path<u64>, state: web::Data<AppState>) -> impl Responder {
    let task_id = path.into_inner();
    let service = state.service.clone();
    match web::block(move || service.reestimate(task_id)).await {
        Ok(outcome) if outcome.success => HttpResponse::Ok().json(outcome),
        Ok(outcome) => HttpResponse::UnprocessableEntity().json(outcome),
        Err(e) => HttpResponse::InternalServerError().json(ErrorResponse::new(e)),
    }
}

pub async fn handle_project_estimate(path: web::Path<u64>, state: web::Data<AppState>) -> impl Responder {
    let project_id = path.into_inner();
    let service = state.service.clone();
    match web::block(move || service.estimate_project_completion(project_id)).await {
        Ok(Ok(estimate)) => HttpResponse::Ok().json(estimate),
        Ok(Err(e @ EstimationError::ProjectNotFound(_))) => HttpResponse::NotFound().json(ErrorResponse::new(e)),
        Ok(Err(e)) => HttpResponse::InternalServerError().json(ErrorResponse::new(e)),
        Err(e) => HttpResponse::InternalServerError().json(ErrorResponse::new(e)),
    }
}

pub async fn handle_reload(state: web::Data<AppState>) -> impl Responder {
    let context = Arc::clone(state.service.context());
    match web::block(move || context.refresh().map(|reloaded| (reloaded, context.loaded_version()))).await {
        Ok(Ok((reloaded, version))) => HttpResponse::Ok().json(ReloadResponse { reloaded, version }),
        Ok(Err(e @ ArtifactLoadError::NothingPublished { .. })) => {
            HttpResponse::ServiceUnavailable().json(ErrorResponse::new(e))
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "model reload failed");
            HttpResponse::InternalServerError().json(ErrorResponse::new(e))
        }
        Err(e) => HttpResponse::InternalServerError().json(ErrorResponse::new(e)),
    }
}

/// Retrains on the blocking pool and publishes the result to the running
/// context. Only one retraining runs at a time.
pub async fn handle_retrain(state: web::Data<AppState>) -> impl Responder {
    let Ok(_guard) = state.retrain_guard.try_lock() else {
        return HttpResponse::Conflict().json(ErrorResponse::new("a retraining run is already in progress"));
    };

    let store = Arc::clone(state.service.store());
    let context = Arc::clone(state.service.context());
    let model_config = state.model_config.clone();
    let training_config = state.training_config.clone();
    let trained = tokio::task::spawn_blocking(move || {
        retrain(store.as_ref(), &model_config, &training_config, context.artifacts(), context.model_name())
    })
    .await;

    match trained {
        Ok(Ok(outcome)) => {
            state.service.context().publish(Arc::clone(&outcome.artifact));
            HttpResponse::Ok().json(RetrainResponse {
                version: outcome.artifact.version().to_string(),
                epochs_trained: outcome.history.epochs_trained(),
                history_entries: outcome.history_entries,
                test_metrics: outcome.test_metrics,
            })
        }
        Ok(Err(e @ TrainingError::InsufficientData { .. })) => {
            tracing::warn!(error = %e, "retraining skipped");
            HttpResponse::UnprocessableEntity().json(ErrorResponse::new(e))
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "retraining failed");
            HttpResponse::InternalServerError().json(ErrorResponse::new(e))
        }
        Err(e) => HttpResponse::InternalServerError().json(ErrorResponse::new(e)),
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{App, http::StatusCode, test};

    use super::*;
    use crate::api::routes;
    use crate::duration_model::ModelConfig;
    use crate::estimation::task_store::{LocalTaskStore, TaskRecord, TaskStatus};
    use crate::estimation::{EstimationContext, EstimationOutcome, EstimationResult, EstimationService};
    use crate::training::artifact_store::tests::tiny_artifact;
    use crate::training::{ArtifactStore, TrainingConfig};

    fn state(dir: &std::path::Path, publish: bool, store: Arc<LocalTaskStore>) -> web::Data<AppState> {
        let artifacts = ArtifactStore::new(dir);
        if publish {
            artifacts.write_version(&tiny_artifact("v1")).unwrap();
            artifacts.promote("v1").unwrap();
        }
        let context = Arc::new(EstimationContext::new(artifacts, "rnn_duration_estimator"));
        let model_config =
            ModelConfig { rnn_units: 4, dense_units: vec![8], branch_units: 4, epochs: 2, seed: Some(1), ..ModelConfig::default() };
        web::Data::new(AppState::new(EstimationService::new(context, store), model_config, TrainingConfig::default()))
    }

    #[actix_web::test]
    async fn test_estimate_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new().app_data(state(dir.path(), true, Arc::new(LocalTaskStore::in_memory()))).configure(routes),
        )
        .await;
        let request = test::TestRequest::post()
            .uri("/estimate")
            .set_json(serde_json::json!({"task_type": "Backend", "complexity": 3, "workload_r1": 0.5, "experience_r1": 4}))
            .to_request();
        let result: EstimationResult = test::call_and_read_body_json(&app, request).await;
        assert!(result.duration_hours >= 1.0);
        assert_eq!(result.model_version, "v1");
    }

    #[actix_web::test]
    async fn test_estimate_without_model_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new().app_data(state(dir.path(), false, Arc::new(LocalTaskStore::in_memory()))).configure(routes),
        )
        .await;
        let request = test::TestRequest::post().uri("/estimate").set_json(serde_json::json!({})).to_request();
        assert_eq!(test::call_service(&app, request).await.status(), StatusCode::SERVICE_UNAVAILABLE);

        let reload = test::TestRequest::post().uri("/model/reload").to_request();
        assert_eq!(test::call_service(&app, reload).await.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_missing_task_is_unprocessable() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new().app_data(state(dir.path(), true, Arc::new(LocalTaskStore::in_memory()))).configure(routes),
        )
        .await;
        let request = test::TestRequest::post().uri("/tasks/42/estimate").to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let outcome: EstimationOutcome = test::read_body_json(response).await;
        assert_eq!(outcome.duration_hours, None);
        assert_eq!(outcome.message, "task 42 not found");

        let project = test::TestRequest::get().uri("/projects/9/estimate").to_request();
        assert_eq!(test::call_service(&app, project).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_task_estimate_and_reestimate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalTaskStore::in_memory());
        store.upsert_task(TaskRecord::new(3, 1)).unwrap();
        let app = test::init_service(App::new().app_data(state(dir.path(), true, store.clone())).configure(routes)).await;

        let estimate = test::TestRequest::post().uri("/tasks/3/estimate").to_request();
        assert_eq!(test::call_service(&app, estimate).await.status(), StatusCode::OK);
        let reestimate = test::TestRequest::post().uri("/tasks/3/reestimate").to_request();
        assert_eq!(test::call_service(&app, reestimate).await.status(), StatusCode::OK);
        assert_eq!(store.estimations().len(), 1);
    }

    #[actix_web::test]
    async fn test_retrain_with_too_few_tasks_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalTaskStore::in_memory());
        for id in 0..5 {
            let mut task = TaskRecord::new(id, 1);
            task.status = TaskStatus::Completed;
            task.actual_duration = Some(6.0);
            store.upsert_task(task).unwrap();
        }
        let app = test::init_service(App::new().app_data(state(dir.path(), false, store)).configure(routes)).await;

        let request = test::TestRequest::post().uri("/model/retrain").to_request();
        assert_eq!(test::call_service(&app, request).await.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(!dir.path().join("CURRENT").exists());
    }
}
