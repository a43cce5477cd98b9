//! Job definitions for the scheduler.
//!
//! This module provides the data model for asynchronous work:
//!
//! - **JobId**: Unique identity assigned at submission
//! - **JobStatus**: Lifecycle states with a terminal predicate
//! - **JobPayload**: Tagged union over the supported job types
//! - **JobRecord**: Full job state as tracked and snapshotted by the scheduler
//! - **JobError**: Handler failure with a retryability flag

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
///
/// Transitions: `Queued -> Processing -> {Completed | Failed | Queued}` (the
/// last arm is a retry re-queue), plus `Queued -> Failed` and
/// `Processing -> Failed` on cancellation. `Completed` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the pending list
    Queued,
    /// Currently executing
    Processing,
    /// Finished successfully; `result` is populated
    Completed,
    /// Finished unsuccessfully; `error` is populated
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// Request to edit an image under an instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEditRequest {
    /// URL of the source image
    pub image_url: String,

    /// Natural-language edit instruction
    pub instruction: String,

    /// Optional mask restricting the editable region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_url: Option<String>,
}

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Request for a chat completion over a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation so far, oldest first
    pub messages: Vec<ChatMessage>,

    /// Optional page context captured by the overlay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// Tagged union over the supported job types.
///
/// Handlers dispatch exhaustively over this enum, so adding a variant is a
/// compile-time checklist of every place that must learn about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum JobPayload {
    ImageEdit(ImageEditRequest),
    Chat(ChatRequest),
}

/// Job type tag, decoupled from the payload body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    ImageEdit,
    Chat,
}

impl JobPayload {
    /// Get the type tag of this payload.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::ImageEdit(_) => JobKind::ImageEdit,
            Self::Chat(_) => JobKind::Chat,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageEdit => write!(f, "image-edit"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for handler failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,

    /// Whether this error is retryable
    pub retryable: bool,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// The error recorded on a cancelled job.
    pub fn cancelled() -> Self {
        Self::fatal("cancelled")
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for JobError {}

impl From<crate::executor::ExecutionError> for JobError {
    fn from(error: crate::executor::ExecutionError) -> Self {
        Self {
            message: error.to_string(),
            // Exhausted retryable failures stay retryable at the job level;
            // the scheduler's own budget decides when to stop.
            retryable: error.retry_exhausted,
        }
    }
}

/// Result of a handler invocation.
pub type HandlerResult = std::result::Result<serde_json::Value, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Full job state as tracked by the scheduler.
///
/// Invariant: once terminal, exactly one of `result` and `error` is present.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    /// Unique identifier, generated at submission
    pub id: JobId,

    /// Owner that submitted the job
    pub owner_id: String,

    /// Typed payload
    pub payload: JobPayload,

    /// Current status
    pub status: JobStatus,

    /// Priority; higher runs first
    pub priority: i32,

    /// When the job was submitted
    pub created_at: DateTime<Utc>,

    /// When the current (or last) execution started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Handler output; present iff Completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Failure message; present iff Failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Failed attempts so far
    pub retry_count: u32,

    /// Retry budget
    pub max_retries: u32,
}

impl JobRecord {
    /// Create a freshly queued record.
    pub fn new(owner_id: String, payload: JobPayload, priority: i32, max_retries: u32) -> Self {
        Self {
            id: JobId::new(),
            owner_id,
            payload,
            status: JobStatus::Queued,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
        }
    }

    /// Get the job type tag.
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to Processing.
    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
    }

    /// Transition to terminal Completed with the handler output.
    pub fn mark_completed(&mut self, result: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        self.error = None;
    }

    /// Transition to terminal Failed with the captured message.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        self.result = None;
    }

    /// Transition back to Queued for another attempt.
    pub fn mark_requeued(&mut self) {
        self.status = JobStatus::Queued;
        self.started_at = None;
    }

    /// Handler duration, if the job has started and finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-only aggregate over the job table, recomputed on demand.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Jobs waiting to run
    pub queued: usize,

    /// Jobs currently executing
    pub processing: usize,

    /// Jobs that finished successfully
    pub completed: usize,

    /// Jobs that finished unsuccessfully
    pub failed: usize,

    /// All tracked jobs
    pub total: usize,

    /// Mean handler duration over completed jobs, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_duration_ms: Option<f64>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_payload() -> JobPayload {
        JobPayload::Chat(ChatRequest {
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: "hello".to_string(),
            }],
            context: None,
        })
    }

    #[test]
    fn test_job_id_uniqueness() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_status_terminal_predicate() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_payload_kind_and_tag() {
        let payload = chat_payload();
        assert_eq!(payload.kind(), JobKind::Chat);
        assert_eq!(payload.kind().to_string(), "chat");

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "chat");

        let image = JobPayload::ImageEdit(ImageEditRequest {
            image_url: "https://example.com/a.png".to_string(),
            instruction: "remove background".to_string(),
            mask_url: None,
        });
        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["type"], "image-edit");
    }

    #[test]
    fn test_terminal_record_single_outcome() {
        let mut record = JobRecord::new("owner".to_string(), chat_payload(), 0, 3);
        record.mark_processing();
        record.mark_completed(serde_json::json!({"text": "hi"}));

        assert!(record.result.is_some());
        assert!(record.error.is_none());

        let mut record = JobRecord::new("owner".to_string(), chat_payload(), 0, 3);
        record.mark_processing();
        record.mark_failed("boom");

        assert!(record.result.is_none());
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_timestamp_ordering_on_completion() {
        let mut record = JobRecord::new("owner".to_string(), chat_payload(), 0, 3);
        record.mark_processing();
        record.mark_completed(serde_json::json!(null));

        let started = record.started_at.unwrap();
        let completed = record.completed_at.unwrap();
        assert!(record.created_at <= started);
        assert!(started <= completed);
        assert!(record.duration().unwrap() >= chrono::Duration::zero());
    }

    #[test]
    fn test_requeue_clears_started_at() {
        let mut record = JobRecord::new("owner".to_string(), chat_payload(), 0, 3);
        record.mark_processing();
        assert!(record.started_at.is_some());

        record.mark_requeued();
        assert_eq!(record.status, JobStatus::Queued);
        assert!(record.started_at.is_none());
    }

    #[test]
    fn test_job_error_retryability() {
        assert!(JobError::retryable("flaky").retryable);
        assert!(!JobError::fatal("broken").retryable);
        let cancelled = JobError::cancelled();
        assert!(!cancelled.retryable);
        assert_eq!(cancelled.message, "cancelled");
    }
}
