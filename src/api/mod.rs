pub mod api_handlers;
pub mod api_objects;

use actix_web::web;

use api_handlers::{
    handle_estimate, handle_estimate_task, handle_project_estimate, handle_reestimate_task, handle_reload,
    handle_retrain,
};

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/estimate", web::post().to(handle_estimate))
        .route("/tasks/{id}/estimate", web::post().to(handle_estimate_task))
        .route("/tasks/{id}/reestimate", web::post().to(handle_reestimate_task))
        .route("/projects/{id}/estimate", web::get().to(handle_project_estimate))
        .route("/model/reload", web::post().to(handle_reload))
        .route("/model/retrain", web::post().to(handle_retrain));
}
