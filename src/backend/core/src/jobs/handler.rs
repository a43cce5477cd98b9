//! Handler plug-points for job execution.
//!
//! The scheduler is agnostic to what a handler does; it only dispatches the
//! typed payload and records the outcome. Handlers receive a cooperative
//! cancellation token and should abandon work promptly once it fires;
//! a handler that ignores it keeps running, but its late outcome is
//! discarded by the scheduler.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::job::{ChatRequest, HandlerResult, ImageEditRequest, JobPayload};

/// Handler for image-edit jobs.
#[async_trait]
pub trait ImageEditHandler: Send + Sync {
    async fn handle(&self, request: &ImageEditRequest, cancel: &CancellationToken)
        -> HandlerResult;
}

/// Handler for chat jobs.
#[async_trait]
pub trait ChatHandler: Send + Sync {
    async fn handle(&self, request: &ChatRequest, cancel: &CancellationToken) -> HandlerResult;
}

/// Registry of one handler per job type.
///
/// Dispatch is an exhaustive match over [`JobPayload`], so a new job type
/// cannot be added without also wiring its handler here.
pub struct HandlerRegistry {
    image_edit: Arc<dyn ImageEditHandler>,
    chat: Arc<dyn ChatHandler>,
}

impl HandlerRegistry {
    /// Create a registry from one handler per job type.
    pub fn new(image_edit: Arc<dyn ImageEditHandler>, chat: Arc<dyn ChatHandler>) -> Self {
        Self { image_edit, chat }
    }

    /// Invoke the handler for a payload.
    pub async fn dispatch(&self, payload: &JobPayload, cancel: &CancellationToken) -> HandlerResult {
        match payload {
            JobPayload::ImageEdit(request) => self.image_edit.handle(request, cancel).await,
            JobPayload::Chat(request) => self.chat.handle(request, cancel).await,
        }
    }

    /// The chat handler, for the synchronous chat path.
    pub fn chat(&self) -> Arc<dyn ChatHandler> {
        Arc::clone(&self.chat)
    }
}
