//! Built-in handlers backed by the HTTP AI provider.
//!
//! These are the default plug-ins for the two job types: each POSTs its
//! typed payload to the configured provider endpoint through the
//! [`ResilientExecutor`], so every provider call gets per-attempt deadlines
//! and classified backoff retries. The provider itself stays an external
//! collaborator behind this seam; swap the registry entries to integrate a
//! different backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LimnError, Result};
use crate::executor::{CallFailure, ResilientExecutor, RetryPolicy};

use super::handler::{ChatHandler, HandlerRegistry, ImageEditHandler};
use super::job::{ChatRequest, HandlerResult, ImageEditRequest, JobError};

// ═══════════════════════════════════════════════════════════════════════════════
// Provider Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the downstream AI provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the provider API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(default)]
    pub api_key: Option<String>,

    /// Deadline for a single provider call attempt
    #[serde(default = "default_attempt_timeout", with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            attempt_timeout: default_attempt_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8188".to_string()
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(30)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Provider Client
// ═══════════════════════════════════════════════════════════════════════════════

/// HTTP client for the AI provider, shared by the built-in handlers.
pub struct ProviderClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    executor: ResilientExecutor,
}

impl ProviderClient {
    /// Create a client from provider configuration and a retry policy.
    pub fn new(config: &ProviderConfig, retry: RetryPolicy) -> Result<Self> {
        retry.validate()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LimnError::configuration("failed to build provider HTTP client")
                .with_source(e))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            executor: ResilientExecutor::new(retry, config.attempt_timeout),
        })
    }

    /// POST a JSON body to a provider path and return the JSON response.
    ///
    /// Runs under the resilient executor: transport failures, attempt
    /// timeouts, and retryable statuses are retried with backoff; other
    /// statuses fail immediately.
    pub async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, crate::executor::ExecutionError> {
        let url = format!("{}{}", self.base_url, path);
        let client = self.client.clone();
        let api_key = self.api_key.clone();

        debug!(url = %url, "provider call");
        self.executor
            .execute(move || {
                let client = client.clone();
                let url = url.clone();
                let body = body.clone();
                let api_key = api_key.clone();
                async move {
                    let mut request = client.post(&url).json(&body);
                    if let Some(key) = &api_key {
                        request = request.bearer_auth(key);
                    }

                    let response = request.send().await.map_err(CallFailure::from)?;
                    let status = response.status();
                    if !status.is_success() {
                        let message = response.text().await.unwrap_or_default();
                        return Err(CallFailure::Status {
                            status: status.as_u16(),
                            message,
                        });
                    }

                    response
                        .json::<serde_json::Value>()
                        .await
                        .map_err(CallFailure::from)
                }
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Built-in Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// Image-edit handler that forwards to the provider's image-edits endpoint.
pub struct HttpImageEditHandler {
    provider: Arc<ProviderClient>,
}

impl HttpImageEditHandler {
    pub fn new(provider: Arc<ProviderClient>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ImageEditHandler for HttpImageEditHandler {
    async fn handle(
        &self,
        request: &ImageEditRequest,
        cancel: &CancellationToken,
    ) -> HandlerResult {
        let body = serde_json::json!({
            "image_url": request.image_url,
            "instruction": request.instruction,
            "mask_url": request.mask_url,
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(JobError::cancelled()),
            result = self.provider.post_json("/v1/images/edits", body) => {
                result.map_err(JobError::from)
            }
        }
    }
}

/// Chat handler that forwards to the provider's chat-completions endpoint.
pub struct HttpChatHandler {
    provider: Arc<ProviderClient>,
}

impl HttpChatHandler {
    pub fn new(provider: Arc<ProviderClient>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChatHandler for HttpChatHandler {
    async fn handle(&self, request: &ChatRequest, cancel: &CancellationToken) -> HandlerResult {
        let body = serde_json::json!({
            "messages": request.messages,
            "context": request.context,
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(JobError::cancelled()),
            result = self.provider.post_json("/v1/chat/completions", body) => {
                result.map_err(JobError::from)
            }
        }
    }
}

/// Build the default registry: both job types backed by one provider client.
pub fn provider_registry(provider: Arc<ProviderClient>) -> Arc<HandlerRegistry> {
    Arc::new(HandlerRegistry::new(
        Arc::new(HttpImageEditHandler::new(Arc::clone(&provider))),
        Arc::new(HttpChatHandler::new(provider)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_config_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.base_url, "http://localhost:8188");
        assert!(config.api_key.is_none());
        assert_eq!(config.attempt_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_client_rejects_invalid_retry_policy() {
        let mut retry = RetryPolicy::default();
        retry.backoff_multiplier = 0.1;
        assert!(ProviderClient::new(&ProviderConfig::default(), retry).is_err());
    }

    #[test]
    fn test_base_url_trailing_slash_is_normalized() {
        let config = ProviderConfig {
            base_url: "http://provider.local/".to_string(),
            ..Default::default()
        };
        let client = ProviderClient::new(&config, RetryPolicy::default()).unwrap();
        assert_eq!(client.base_url, "http://provider.local");
    }
}
