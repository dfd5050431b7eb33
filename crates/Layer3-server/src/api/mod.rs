//! HTTP API
//!
//! Thin axum layer over [`TaskService`]: extract actor and confirmation,
//! call the service, map errors to status codes.

mod error;
mod tasks;

use axum::routing::{get, post};
use axum::Router;
use harbor_task::TaskService;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TaskService>,
    /// Lowercase name of the forward-auth header carrying the actor
    pub actor_header: String,
}

pub fn router(state: AppState) -> Router {
    let tasks = Router::new()
        .route("/tasks", post(tasks::enqueue).get(tasks::list))
        .route("/tasks/:task_id", get(tasks::get))
        .route("/tasks/:task_id/logs", get(tasks::logs))
        .route("/tasks/:task_id/retry", post(tasks::retry))
        .route("/tasks/:task_id/download", get(tasks::download));

    Router::new()
        .route("/healthz", get(tasks::healthz))
        .nest("/api/v1", tasks)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
