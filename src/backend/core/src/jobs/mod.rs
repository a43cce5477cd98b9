//! Asynchronous job system for the Limn backend core.
//!
//! This module owns the full lifecycle of AI-editing and chat work:
//!
//! - **Job model**: Typed payloads, status lifecycle, and snapshots
//! - **Handlers**: One plug-in per job type, dispatched exhaustively
//! - **Scheduler**: Priority queue with bounded concurrency, retries,
//!   waitable completion, and retention-based garbage collection
//! - **Built-ins**: Provider-backed default handlers running through the
//!   resilient executor
//!
//! # Architecture
//!
//! ```text
//! submit ──▶ pending list ──tick──▶ Processing ──▶ Completed
//!                 ▲                     │  │
//!                 └──── retry ◀─────────┘  └─────▶ Failed
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use limn_core::jobs::{JobScheduler, SchedulerConfig, JobPayload};
//!
//! let scheduler = JobScheduler::new(SchedulerConfig::default(), handlers);
//! let handle = scheduler.clone().start();
//!
//! let job_id = scheduler.submit("owner-1", payload, 5);
//! let job = scheduler.await_completion(job_id, Duration::from_secs(30)).await?;
//! ```

pub mod builtin;
pub mod handler;
pub mod job;
pub mod scheduler;

pub use builtin::{
    provider_registry, HttpChatHandler, HttpImageEditHandler, ProviderClient, ProviderConfig,
};
pub use handler::{ChatHandler, HandlerRegistry, ImageEditHandler};
pub use job::{
    ChatMessage, ChatRequest, ChatRole, HandlerResult, ImageEditRequest, JobError, JobId, JobKind,
    JobPayload, JobRecord, JobStatus, QueueStats,
};
pub use scheduler::{JobScheduler, SchedulerConfig, SchedulerHandle};
