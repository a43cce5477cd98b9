//! # Limn Core
//!
//! Backend request-processing core for the Limn AI overlay.
//!
//! ## Architecture
//!
//! - **Admission**: Per-client, per-endpoint fixed-window rate limiting with
//!   a fail-open policy
//! - **Jobs**: Priority scheduling with bounded concurrency, retries,
//!   waitable completion, and retention-based garbage collection
//! - **Executor**: Timeout + exponential-backoff retry wrapper around
//!   downstream AI-provider calls
//! - **API**: Axum REST surface for submission, status, waiting,
//!   cancellation, and the synchronous chat path
//! - **Telemetry**: Structured tracing and Prometheus metrics

pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorSeverity, LimnError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admission::{
        AdmissionConfig, AdmissionController, AdmissionDecision, ClientKey, EndpointLimit,
    };
    pub use crate::error::{ErrorCode, LimnError, Result};
    pub use crate::executor::{
        CallFailure, ExecutionError, FailureKind, ResilientExecutor, RetryPolicy,
    };
    pub use crate::jobs::{
        ChatHandler, ChatMessage, ChatRequest, ChatRole, HandlerRegistry, ImageEditHandler,
        ImageEditRequest, JobError, JobId, JobKind, JobPayload, JobRecord, JobScheduler,
        JobStatus, QueueStats, SchedulerConfig, SchedulerHandle,
    };
}
