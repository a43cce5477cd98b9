//! Resilient execution of downstream calls.
//!
//! This module provides the retry wrapper used for every expensive call
//! against the AI provider:
//!
//! - **RetryPolicy**: Configuration for retry behavior with exponential backoff
//! - **CallFailure**: Classified failure of a single attempt
//! - **ResilientExecutor**: Timeout + backoff retry driver around an operation
//!
//! Each attempt is bounded by a deadline; when the deadline fires the attempt
//! future is dropped, which aborts the in-flight call. A fired deadline is a
//! retryable [`CallFailure::Timeout`]. Non-retryable failures short-circuit
//! immediately without consuming the remaining retry budget.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{ErrorCode, ErrorDetails, LimnError};

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries)
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound on the computed delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Multiplier applied per retry (exponential growth)
    pub backoff_multiplier: f64,

    /// HTTP status codes treated as retryable
    pub retryable_status_codes: HashSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

fn default_retryable_status_codes() -> HashSet<u16> {
    [408, 429, 500, 502, 503, 504].into_iter().collect()
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with a specific number of retries.
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Validate the policy invariants.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_delay < self.base_delay {
            return Err(LimnError::configuration(
                "retry policy: max_delay must be >= base_delay",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(LimnError::configuration(
                "retry policy: backoff_multiplier must be >= 1",
            ));
        }
        Ok(())
    }

    /// Calculate the delay before a given attempt (1-indexed).
    ///
    /// The first attempt is never delayed. For attempt `k >= 2` the delay is
    /// `min(base_delay * backoff_multiplier^(k-2), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let delay = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Check whether a classified failure should be retried under this policy.
    pub fn is_retryable(&self, failure: &CallFailure) -> bool {
        match failure {
            CallFailure::Network(_) | CallFailure::Timeout => true,
            CallFailure::Status { status, .. } => self.retryable_status_codes.contains(status),
            CallFailure::Other(_) => false,
        }
    }

    /// Total attempts this policy allows.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Failure Classification
// ═══════════════════════════════════════════════════════════════════════════════

/// Classified failure of a single downstream attempt.
#[derive(Debug, Clone, Error)]
pub enum CallFailure {
    /// Transport-level failure (connection refused, DNS, broken pipe, ...)
    #[error("network error: {0}")]
    Network(String),

    /// The attempt deadline fired before the call finished
    #[error("attempt timed out")]
    Timeout,

    /// The provider answered with a non-success HTTP status
    #[error("upstream returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// Anything the classifier cannot place; never retried
    #[error("{0}")]
    Other(String),
}

/// Coarse failure kind reported to callers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Network,
    Timeout,
    HttpStatus,
    Unknown,
}

impl CallFailure {
    /// Get the coarse kind of this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network(_) => FailureKind::Network,
            Self::Timeout => FailureKind::Timeout,
            Self::Status { .. } => FailureKind::HttpStatus,
            Self::Other(_) => FailureKind::Unknown,
        }
    }
}

impl From<reqwest::Error> for CallFailure {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() || error.is_request() || error.is_body() {
            Self::Network(error.to_string())
        } else if let Some(status) = error.status() {
            Self::Status {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else {
            Self::Other(error.to_string())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Terminal failure of a resilient execution, annotated with the
/// classification of the last attempt and the number of attempts made.
#[derive(Debug, Clone, Error)]
#[error("call failed after {attempts} attempt(s): {failure}")]
pub struct ExecutionError {
    /// The failure from the last attempt
    pub failure: CallFailure,

    /// Coarse kind of the last failure
    pub kind: FailureKind,

    /// Attempts actually made (1..=1+max_retries)
    pub attempts: u32,

    /// True when the retry budget was exhausted on retryable failures,
    /// false when a non-retryable failure short-circuited
    pub retry_exhausted: bool,
}

impl From<ExecutionError> for LimnError {
    fn from(error: ExecutionError) -> Self {
        let code = if error.retry_exhausted {
            ErrorCode::RetryExhausted
        } else {
            ErrorCode::JobExecutionFailed
        };
        LimnError::with_internal(code, "Downstream call failed", error.to_string()).with_details(
            ErrorDetails::new()
                .with_context("kind", error.kind)
                .with_context("attempts", error.attempts),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resilient Executor
// ═══════════════════════════════════════════════════════════════════════════════

/// Timeout + backoff retry driver around a single downstream operation.
///
/// The executor holds no cross-call state; it is cheap to clone and safe to
/// share between handlers.
#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl ResilientExecutor {
    /// Create a new executor from a policy and a per-attempt deadline.
    pub fn new(policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            policy,
            attempt_timeout,
        }
    }

    /// Get the policy driving this executor.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, a non-retryable failure occurs, or
    /// the retry budget is exhausted.
    ///
    /// `operation` is invoked once per attempt and must produce a fresh
    /// future each time. A deadline of `attempt_timeout` bounds every
    /// attempt; firing it drops the attempt future and records a retryable
    /// [`CallFailure::Timeout`].
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> std::result::Result<T, ExecutionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallFailure>>,
    {
        let total_attempts = self.policy.total_attempts();
        let mut last_failure: Option<CallFailure> = None;

        for attempt in 1..=total_attempts {
            let delay = self.policy.delay_for_attempt(attempt);
            if !delay.is_zero() {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::time::sleep(delay).await;
            }

            counter!("limn_executor_attempts_total").increment(1);

            match tokio::time::timeout(self.attempt_timeout, operation()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(failure)) => {
                    counter!(
                        "limn_executor_failures_total",
                        "kind" => format!("{:?}", failure.kind()),
                    )
                    .increment(1);

                    if !self.policy.is_retryable(&failure) {
                        warn!(attempt, error = %failure, "non-retryable failure, giving up");
                        return Err(ExecutionError {
                            kind: failure.kind(),
                            attempts: attempt,
                            retry_exhausted: false,
                            failure,
                        });
                    }

                    warn!(
                        attempt,
                        max_attempts = total_attempts,
                        error = %failure,
                        "retryable failure"
                    );
                    last_failure = Some(failure);
                }
                Err(_elapsed) => {
                    counter!(
                        "limn_executor_failures_total",
                        "kind" => "Timeout".to_string(),
                    )
                    .increment(1);

                    warn!(
                        attempt,
                        max_attempts = total_attempts,
                        timeout_ms = self.attempt_timeout.as_millis() as u64,
                        "attempt deadline fired"
                    );
                    last_failure = Some(CallFailure::Timeout);
                }
            }
        }

        let failure = last_failure
            .unwrap_or_else(|| CallFailure::Other("no attempts were executed".to_string()));
        Err(ExecutionError {
            kind: failure.kind(),
            attempts: total_attempts,
            retry_exhausted: true,
            failure,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            retryable_status_codes: [503].into_iter().collect(),
        }
    }

    #[test]
    fn test_first_attempt_never_delayed() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_backoff_monotonic_until_clamped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            backoff_multiplier: 2.0,
            retryable_status_codes: default_retryable_status_codes(),
        };

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(800));
        // Clamped from here on
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(12), Duration::from_millis(800));
    }

    #[test]
    fn test_policy_validation() {
        let mut policy = RetryPolicy::default();
        assert!(policy.validate().is_ok());

        policy.max_delay = Duration::from_millis(1);
        assert!(policy.validate().is_err());

        policy.max_delay = Duration::from_secs(30);
        policy.backoff_multiplier = 0.5;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_classification() {
        let policy = RetryPolicy::default();

        assert!(policy.is_retryable(&CallFailure::Timeout));
        assert!(policy.is_retryable(&CallFailure::Network("refused".into())));
        assert!(policy.is_retryable(&CallFailure::Status {
            status: 503,
            message: String::new()
        }));
        assert!(!policy.is_retryable(&CallFailure::Status {
            status: 400,
            message: String::new()
        }));
        assert!(!policy.is_retryable(&CallFailure::Other("bug".into())));
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let executor = ResilientExecutor::new(fast_policy(3), Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = executor
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CallFailure>(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_failures_then_success() {
        let executor = ResilientExecutor::new(fast_policy(3), Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = executor
            .execute(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(CallFailure::Network("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_short_circuits() {
        let executor = ResilientExecutor::new(fast_policy(5), Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let error = executor
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(CallFailure::Status {
                        status: 401,
                        message: "nope".into(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(error.attempts, 1);
        assert_eq!(error.kind, FailureKind::HttpStatus);
        assert!(!error.retry_exhausted);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let executor = ResilientExecutor::new(fast_policy(2), Duration::from_millis(100));

        let error = executor
            .execute(|| async { Err::<u32, _>(CallFailure::Network("down".into())) })
            .await
            .unwrap_err();

        assert_eq!(error.attempts, 3);
        assert_eq!(error.kind, FailureKind::Network);
        assert!(error.retry_exhausted);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let executor = ResilientExecutor::new(fast_policy(1), Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let error = executor
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, CallFailure>(0)
                }
            })
            .await
            .unwrap_err();

        // Both attempts timed out
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(error.attempts, 2);
        assert_eq!(error.kind, FailureKind::Timeout);
        assert!(error.retry_exhausted);
    }

    #[test]
    fn test_execution_error_maps_to_limn_error() {
        let exhausted = ExecutionError {
            failure: CallFailure::Timeout,
            kind: FailureKind::Timeout,
            attempts: 4,
            retry_exhausted: true,
        };
        let mapped: LimnError = exhausted.into();
        assert_eq!(mapped.code(), ErrorCode::RetryExhausted);

        let fatal = ExecutionError {
            failure: CallFailure::Status {
                status: 400,
                message: "bad".into(),
            },
            kind: FailureKind::HttpStatus,
            attempts: 1,
            retry_exhausted: false,
        };
        let mapped: LimnError = fatal.into();
        assert_eq!(mapped.code(), ErrorCode::JobExecutionFailed);
    }
}
