use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, web};

use task_duration_estimator::api::api_objects::AppState;
use task_duration_estimator::api::routes;
use task_duration_estimator::estimation::{EstimationContext, EstimationService, LocalTaskStore, TaskStore};
use task_duration_estimator::training::ArtifactStore;
use task_duration_estimator::utils::{init_tracing, load_config};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = load_config();

    let store: Arc<dyn TaskStore> = match &config.task_store_path {
        Some(path) => Arc::new(LocalTaskStore::open(path)?),
        None => Arc::new(LocalTaskStore::in_memory()),
    };
    let context = Arc::new(
        EstimationContext::new(ArtifactStore::new(&config.model_dir), config.model_name.clone())
            .with_refresh_interval(Duration::from_secs(config.model_refresh_secs)),
    );
    match context.artifact() {
        Ok(artifact) => tracing::info!(version = artifact.version(), "model ready"),
        Err(e) => tracing::warn!(error = %e, "starting without a published model"),
    }

    let state = web::Data::new(AppState::new(
        EstimationService::new(context, store),
        config.model.clone(),
        config.training.clone(),
    ));
    tracing::info!(address = %config.bind_address, "server started");
    HttpServer::new(move || App::new().app_data(state.clone()).configure(routes))
        .bind(&config.bind_address)?
        .run()
        .await?;
    Ok(())
}
