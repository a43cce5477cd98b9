//! End-to-end tests for the REST API over a real listener, with the AI
//! provider mocked.
//!
//! Tests cover:
//! - Submit / wait / status round trip through the scheduler
//! - The admission gate returning 429 with Retry-After
//! - Cancellation semantics over HTTP
//! - Validation failures
//! - Health endpoint

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use limn_core::admission::{AdmissionConfig, AdmissionController, EndpointLimit};
use limn_core::api::{build_router, AppState};
use limn_core::executor::RetryPolicy;
use limn_core::jobs::{
    provider_registry, JobScheduler, ProviderClient, ProviderConfig, SchedulerConfig,
    SchedulerHandle,
};

/// Boot the full stack against a mock provider. The returned handle keeps
/// the scheduler loops alive for the duration of the test.
async fn start_server(provider_server: &MockServer) -> (String, SchedulerHandle) {
    let provider_config = ProviderConfig {
        base_url: provider_server.uri(),
        api_key: None,
        attempt_timeout: Duration::from_secs(2),
    };
    let provider =
        Arc::new(ProviderClient::new(&provider_config, RetryPolicy::no_retry()).unwrap());
    let handlers = provider_registry(provider);

    let scheduler_config = SchedulerConfig {
        max_concurrent_jobs: 2,
        tick_interval: Duration::from_millis(10),
        retention_window: Duration::from_secs(3600),
        sweep_interval: Duration::from_secs(3600),
        default_max_retries: 0,
    };
    let scheduler = JobScheduler::new(scheduler_config, Arc::clone(&handlers));
    let scheduler_handle = Arc::clone(&scheduler).start();

    let mut endpoints = std::collections::HashMap::new();
    endpoints.insert(
        "chat.completions".to_string(),
        EndpointLimit::new(2, Duration::from_secs(60)),
    );
    let admission = Arc::new(AdmissionController::new(AdmissionConfig {
        default_limit: EndpointLimit::new(1000, Duration::from_secs(60)),
        endpoints,
        sweep_interval: Duration::from_secs(300),
    }));

    let state = AppState {
        scheduler,
        admission,
        handlers,
        metrics: PrometheusBuilder::new().build_recorder().handle(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (format!("http://{}", addr), scheduler_handle)
}

fn chat_body() -> serde_json::Value {
    serde_json::json!({
        "messages": [{ "role": "user", "content": "ping" }]
    })
}

#[tokio::test]
async fn test_submit_wait_and_status_round_trip() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "text": "pong" })),
        )
        .mount(&provider)
        .await;

    let (base, _scheduler) = start_server(&provider).await;
    let client = reqwest::Client::new();

    let submitted: serde_json::Value = client
        .post(format!("{}/api/v1/jobs", base))
        .json(&serde_json::json!({
            "owner_id": "user-1",
            "type": "chat",
            "payload": { "messages": [{ "role": "user", "content": "ping" }] },
            "priority": 1
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(submitted["success"], true);
    let job_id = submitted["data"]["job_id"].as_str().unwrap().to_string();

    let waited: serde_json::Value = client
        .get(format!("{}/api/v1/jobs/{}/wait?timeout_ms=5000", base, job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(waited["data"]["status"], "completed");
    assert_eq!(waited["data"]["result"]["text"], "pong");

    let status: serde_json::Value = client
        .get(format!("{}/api/v1/jobs/{}", base, job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["data"]["status"], "completed");
    assert_eq!(status["data"]["owner_id"], "user-1");

    let listing: serde_json::Value = client
        .get(format!("{}/api/v1/jobs?owner_id=user-1", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["data"].as_array().unwrap().len(), 1);

    let stats: serde_json::Value = client
        .get(format!("{}/api/v1/queue/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["data"]["completed"], 1);
}

#[tokio::test]
async fn test_chat_admission_gate_returns_429() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "text": "ok" })),
        )
        .mount(&provider)
        .await;

    let (base, _scheduler) = start_server(&provider).await;
    let client = reqwest::Client::new();

    // chat.completions is limited to 2 per window in the test config
    for _ in 0..2 {
        let response = client
            .post(format!("{}/api/v1/chat/completions", base))
            .header("x-api-key", "widget-key")
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let denied = client
        .post(format!("{}/api/v1/chat/completions", base))
        .header("x-api-key", "widget-key")
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 429);
    let retry_after: u64 = denied
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 60);

    let body: serde_json::Value = denied.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "ADMISSION_DENIED");

    // A different client key is unaffected
    let other = client
        .post(format!("{}/api/v1/chat/completions", base))
        .header("x-api-key", "another-key")
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), 200);
}

#[tokio::test]
async fn test_cancel_unknown_job_reports_false() {
    let provider = MockServer::start().await;
    let (base, _scheduler) = start_server(&provider).await;
    let client = reqwest::Client::new();

    let response: serde_json::Value = client
        .delete(format!(
            "{}/api/v1/jobs/00000000-0000-4000-8000-000000000000",
            base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["data"]["cancelled"], false);
}

#[tokio::test]
async fn test_submit_validation_rejects_empty_owner() {
    let provider = MockServer::start().await;
    let (base, _scheduler) = start_server(&provider).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/jobs", base))
        .json(&serde_json::json!({
            "owner_id": "  ",
            "type": "chat",
            "payload": { "messages": [] }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn test_unknown_job_status_is_404() {
    let provider = MockServer::start().await;
    let (base, _scheduler) = start_server(&provider).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "{}/api/v1/jobs/00000000-0000-4000-8000-000000000000",
            base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_health_endpoint() {
    let provider = MockServer::start().await;
    let (base, _scheduler) = start_server(&provider).await;

    let response: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["status"], "healthy");
}
