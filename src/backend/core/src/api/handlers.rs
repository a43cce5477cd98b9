//! API request handlers with proper error propagation.
//!
//! All fallible handlers return `Result<impl IntoResponse, LimnError>` so
//! that errors are converted to HTTP responses via the `IntoResponse`
//! implementation on `LimnError`.
//!
//! Client identity for admission is derived from the `X-Api-Key` header when
//! present, otherwise from the peer address.

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ApiResponse, AppState};
use crate::admission::{AdmissionDecision, ClientKey};
use crate::error::{ErrorCode, LimnError};
use crate::jobs::{ChatRequest, JobError, JobId, JobPayload};

/// Longest supported server-side wait in `wait_job`.
const MAX_WAIT: Duration = Duration::from_secs(120);
const DEFAULT_WAIT: Duration = Duration::from_secs(30);

// ═══════════════════════════════════════════════════════════════════════════════
// Health and Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Admission Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Derive the rate-limiting identity for a request.
fn client_key(headers: &HeaderMap, addr: &SocketAddr) -> ClientKey {
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(ClientKey::from_api_key)
        .unwrap_or_else(|| ClientKey::from_addr(addr.ip()))
}

/// Run the admission gate for an endpoint, converting a denial into the
/// API error (429 + Retry-After).
fn check_admission(state: &AppState, key: &ClientKey, endpoint: &str) -> Result<(), LimnError> {
    match state.admission.admit(key, endpoint) {
        AdmissionDecision::Allowed => Ok(()),
        AdmissionDecision::Denied { retry_after_secs } => {
            Err(LimnError::admission_denied(retry_after_secs))
        }
    }
}

/// Map a synchronous handler failure onto the API error taxonomy.
fn handler_error(error: JobError) -> LimnError {
    let code = if error.retryable {
        ErrorCode::RetryExhausted
    } else {
        ErrorCode::JobExecutionFailed
    };
    LimnError::with_internal(code, "Chat request failed", error.message)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    pub owner_id: String,
    #[serde(flatten)]
    pub job: JobPayload,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Serialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

pub async fn submit_job(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, LimnError> {
    if request.owner_id.trim().is_empty() {
        return Err(LimnError::validation("owner_id cannot be empty"));
    }

    let key = client_key(&headers, &addr);
    check_admission(&state, &key, "jobs.submit")?;

    let job_id = state
        .scheduler
        .submit(request.owner_id, request.job, request.priority);

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(SubmitJobResponse { job_id })),
    ))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, LimnError> {
    let job = state.scheduler.get_status(JobId::from_uuid(id))?;
    Ok(Json(ApiResponse::success(job)))
}

#[derive(Deserialize)]
pub struct WaitParams {
    pub timeout_ms: Option<u64>,
}

pub async fn wait_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<WaitParams>,
) -> Result<impl IntoResponse, LimnError> {
    let timeout = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_WAIT)
        .min(MAX_WAIT);

    let job = state
        .scheduler
        .await_completion(JobId::from_uuid(id), timeout)
        .await?;
    Ok(Json(ApiResponse::success(job)))
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    // `false` covers both "not found" and "already terminal"
    let cancelled = state.scheduler.cancel(JobId::from_uuid(id));
    Json(ApiResponse::success(CancelResponse { cancelled }))
}

#[derive(Deserialize)]
pub struct OwnerParams {
    pub owner_id: String,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<OwnerParams>,
) -> Result<impl IntoResponse, LimnError> {
    if params.owner_id.trim().is_empty() {
        return Err(LimnError::validation("owner_id cannot be empty"));
    }
    let jobs = state.scheduler.get_jobs_for_owner(&params.owner_id);
    Ok(Json(ApiResponse::success(jobs)))
}

pub async fn queue_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.scheduler.get_queue_stats()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Synchronous Chat
// ═══════════════════════════════════════════════════════════════════════════════

/// Synchronous chat: admission gate, then straight through the chat handler
/// (and its resilient executor) without touching the job queue.
pub async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, LimnError> {
    if request.messages.is_empty() {
        return Err(LimnError::validation("messages cannot be empty"));
    }

    let key = client_key(&headers, &addr);
    check_admission(&state, &key, "chat.completions")?;

    let cancel = CancellationToken::new();
    let output = state
        .handlers
        .chat()
        .handle(&request, &cancel)
        .await
        .map_err(handler_error)?;

    Ok(Json(ApiResponse::success(output)))
}
