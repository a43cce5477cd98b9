//! REST API layer for the Limn backend core.
//!
//! Exposes the job system and the synchronous chat path over Axum:
//!
//! - `GET  /health` - liveness
//! - `GET  /metrics` - Prometheus exposition
//! - `POST /api/v1/jobs` - submit a job (admission gated)
//! - `GET  /api/v1/jobs/{id}` - job snapshot
//! - `GET  /api/v1/jobs/{id}/wait` - block until terminal or timeout
//! - `DELETE /api/v1/jobs/{id}` - cancel
//! - `GET  /api/v1/jobs?owner_id=` - owner listing, newest first
//! - `GET  /api/v1/queue/stats` - queue statistics
//! - `POST /api/v1/chat/completions` - synchronous chat (admission gated)

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::admission::AdmissionController;
use crate::jobs::{HandlerRegistry, JobScheduler};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<JobScheduler>,
    pub admission: Arc<AdmissionController>,
    pub handlers: Arc<HandlerRegistry>,
    pub metrics: PrometheusHandle,
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route(
            "/api/v1/jobs",
            post(handlers::submit_job).get(handlers::list_jobs),
        )
        .route(
            "/api/v1/jobs/:id",
            get(handlers::get_job).delete(handlers::cancel_job),
        )
        .route("/api/v1/jobs/:id/wait", get(handlers::wait_job))
        .route("/api/v1/queue/stats", get(handlers::queue_stats))
        .route("/api/v1/chat/completions", post(handlers::chat_completions))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper.
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}
