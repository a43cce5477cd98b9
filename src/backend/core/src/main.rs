//! Limn Server - Main entry point
//!
//! Wires the admission controller, job scheduler, provider-backed handlers,
//! and the REST API together and runs until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;

use limn_core::{
    admission::AdmissionController,
    api::{self, AppState},
    config::Config,
    jobs::{provider_registry, JobScheduler, ProviderClient},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    // Initialize telemetry
    let metrics_handle = telemetry::init_telemetry(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Limn Server"
    );

    // Admission controller with its expiry sweeper
    let admission = Arc::new(AdmissionController::new(config.admission.clone()));
    let admission_sweeper = Arc::clone(&admission).start_sweeper();

    // Provider client and handler registry
    let provider = Arc::new(ProviderClient::new(&config.provider, config.retry.clone())?);
    let handlers = provider_registry(provider);
    tracing::info!(base_url = %config.provider.base_url, "Provider client initialized");

    // Job scheduler with its dispatch and retention loops
    let scheduler = JobScheduler::new(config.scheduler.clone(), Arc::clone(&handlers));
    let scheduler_handle = Arc::clone(&scheduler).start();
    tracing::info!(
        max_concurrent_jobs = config.scheduler.max_concurrent_jobs,
        "Scheduler initialized"
    );

    // Create app state and router
    let app_state = AppState {
        scheduler,
        admission,
        handlers,
        metrics: metrics_handle,
    };
    let app = api::build_router(app_state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Cleanup
    scheduler_handle.shutdown();
    admission_sweeper.shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
