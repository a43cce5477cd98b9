//! Admission control with fixed-window rate limiting.
//!
//! Every client request passes through the [`AdmissionController`] before it
//! may consume shared capacity. Limits are configured per endpoint with a
//! default entry for endpoints that have no explicit configuration.
//!
//! The controller fails open: an internal error during an admission check is
//! logged and counted, and the request is allowed through. Availability wins
//! over strict enforcement here; admission never surfaces a hard failure.

use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Client Identity
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity used for rate limiting, derived from an API key when present,
/// else from the peer address. Opaque past construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientKey(String);

impl ClientKey {
    /// Derive a client key from an API key.
    pub fn from_api_key(key: &str) -> Self {
        Self(format!("key:{}", key))
    }

    /// Derive a client key from a peer IP address.
    pub fn from_addr(addr: IpAddr) -> Self {
        Self(format!("ip:{}", addr))
    }

    /// Use an already-derived opaque identity.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-endpoint rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointLimit {
    /// Requests allowed per window
    pub max_requests: u32,

    /// Window duration
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl EndpointLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// Admission controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Limit applied to endpoints without an explicit entry
    #[serde(default = "default_limit")]
    pub default_limit: EndpointLimit,

    /// Per-endpoint limits (endpoint name -> limit)
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointLimit>,

    /// Interval between sweeps of expired windows
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            endpoints: HashMap::new(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_limit() -> EndpointLimit {
    EndpointLimit::new(60, Duration::from_secs(60))
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

impl AdmissionConfig {
    /// Look up the limit for an endpoint, falling back to the default entry.
    pub fn limit_for(&self, endpoint: &str) -> &EndpointLimit {
        self.endpoints.get(endpoint).unwrap_or(&self.default_limit)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Admission Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The request may proceed
    Allowed,
    /// The request is rejected; retry after the given number of seconds
    Denied { retry_after_secs: u64 },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Internal admission failures. Never surfaced to callers; the controller
/// fails open on every variant.
#[derive(Debug, Error)]
enum AdmissionError {
    #[error("window counter overflow")]
    CounterOverflow,

    #[error("clock arithmetic overflow")]
    Clock,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rate Window State
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed-window counter for one (client, endpoint) pair.
///
/// Invariant: the counter is reset only when `now >= reset_at`, at which
/// point a fresh window starts.
#[derive(Debug, Clone)]
struct RateWindow {
    count: u32,
    reset_at: Instant,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Admission Controller
// ═══════════════════════════════════════════════════════════════════════════════

/// Stateless-per-request admission gate with fixed-window counters.
///
/// All window mutation happens through the sharded map, so admission checks
/// and the expiry sweep share one mutual-exclusion discipline and cannot
/// race on the same key.
pub struct AdmissionController {
    config: AdmissionConfig,
    windows: DashMap<(ClientKey, String), RateWindow>,
}

impl AdmissionController {
    /// Create a new controller from configuration.
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Decide whether a request from `client` to `endpoint` may proceed.
    ///
    /// Never fails: internal errors are logged and treated as allowed.
    pub fn admit(&self, client: &ClientKey, endpoint: &str) -> AdmissionDecision {
        let decision = match self.try_admit(client, endpoint) {
            Ok(decision) => decision,
            Err(error) => {
                warn!(
                    client = %client,
                    endpoint = endpoint,
                    error = %error,
                    "admission check failed internally, failing open"
                );
                counter!("limn_admission_fail_open_total").increment(1);
                AdmissionDecision::Allowed
            }
        };

        counter!(
            "limn_admission_checks_total",
            "endpoint" => endpoint.to_string(),
            "allowed" => decision.is_allowed().to_string(),
        )
        .increment(1);

        decision
    }

    /// The fallible admission check proper.
    fn try_admit(
        &self,
        client: &ClientKey,
        endpoint: &str,
    ) -> std::result::Result<AdmissionDecision, AdmissionError> {
        let limit = self.config.limit_for(endpoint);
        let now = Instant::now();
        let fresh_reset = now.checked_add(limit.window).ok_or(AdmissionError::Clock)?;

        let key = (client.clone(), endpoint.to_string());
        let mut entry = self.windows.entry(key).or_insert_with(|| RateWindow {
            count: 0,
            reset_at: fresh_reset,
        });
        let window = entry.value_mut();

        // Lazy expiry: a window past its boundary restarts wholesale.
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = fresh_reset;
        }

        if window.count >= limit.max_requests {
            let remaining = window.reset_at.saturating_duration_since(now);
            let retry_after_secs = (remaining.as_millis().div_ceil(1000) as u64).max(1);
            debug!(
                client = %client,
                endpoint = endpoint,
                count = window.count,
                limit = limit.max_requests,
                retry_after_secs,
                "admission denied"
            );
            return Ok(AdmissionDecision::Denied { retry_after_secs });
        }

        window.count = window
            .count
            .checked_add(1)
            .ok_or(AdmissionError::CounterOverflow)?;
        Ok(AdmissionDecision::Allowed)
    }

    /// Remove expired windows. Returns the number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| now < window.reset_at);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, "swept expired rate windows");
        }
        removed
    }

    /// Number of live windows, for stats and tests.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Spawn the periodic expiry sweep, returning a handle that stops it.
    pub fn start_sweeper(self: Arc<Self>) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let controller = self;
        let interval = controller.config.sweep_interval;

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick fires immediately; skip it so a fresh
            // controller is not swept before it has served anything.
            tick.tick().await;

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // A dropped handle counts as shutdown
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        controller.sweep_expired();
                    }
                }
            }

            info!("admission sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
        }
    }
}

/// Handle for stopping the admission sweeper.
pub struct SweeperHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_requests: u32, window: Duration) -> AdmissionController {
        AdmissionController::new(AdmissionConfig {
            default_limit: EndpointLimit::new(max_requests, window),
            endpoints: HashMap::new(),
            sweep_interval: Duration::from_secs(300),
        })
    }

    #[test]
    fn test_allows_up_to_limit_then_denies() {
        let controller = controller(3, Duration::from_secs(60));
        let client = ClientKey::from_raw("key:test");

        for _ in 0..3 {
            assert!(controller.admit(&client, "jobs.submit").is_allowed());
        }

        match controller.admit(&client, "jobs.submit") {
            AdmissionDecision::Denied { retry_after_secs } => {
                assert!(retry_after_secs > 0);
                assert!(retry_after_secs <= 60);
            }
            AdmissionDecision::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn test_window_expiry_resets_counter() {
        let controller = controller(1, Duration::from_millis(20));
        let client = ClientKey::from_raw("key:test");

        assert!(controller.admit(&client, "chat").is_allowed());
        assert!(!controller.admit(&client, "chat").is_allowed());

        std::thread::sleep(Duration::from_millis(30));
        assert!(controller.admit(&client, "chat").is_allowed());
    }

    #[test]
    fn test_clients_and_endpoints_are_isolated() {
        let controller = controller(1, Duration::from_secs(60));
        let alice = ClientKey::from_api_key("alice");
        let bob = ClientKey::from_api_key("bob");

        assert!(controller.admit(&alice, "jobs.submit").is_allowed());
        assert!(!controller.admit(&alice, "jobs.submit").is_allowed());

        // A different client is unaffected
        assert!(controller.admit(&bob, "jobs.submit").is_allowed());
        // A different endpoint for the same client is unaffected
        assert!(controller.admit(&alice, "chat").is_allowed());
    }

    #[test]
    fn test_endpoint_specific_limit_overrides_default() {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "jobs.submit".to_string(),
            EndpointLimit::new(1, Duration::from_secs(60)),
        );
        let controller = AdmissionController::new(AdmissionConfig {
            default_limit: EndpointLimit::new(100, Duration::from_secs(60)),
            endpoints,
            sweep_interval: Duration::from_secs(300),
        });
        let client = ClientKey::from_raw("ip:10.0.0.1");

        assert!(controller.admit(&client, "jobs.submit").is_allowed());
        assert!(!controller.admit(&client, "jobs.submit").is_allowed());

        // Unconfigured endpoint falls back to the generous default
        for _ in 0..10 {
            assert!(controller.admit(&client, "unconfigured").is_allowed());
        }
    }

    #[test]
    fn test_sweep_removes_only_expired_windows() {
        let controller = controller(5, Duration::from_millis(10));
        let expired = ClientKey::from_raw("key:expired");
        controller.admit(&expired, "chat");

        std::thread::sleep(Duration::from_millis(20));

        let live = ClientKey::from_raw("key:live");
        // Fresh window, 10ms out
        controller.admit(&live, "chat");

        assert_eq!(controller.window_count(), 2);
        assert_eq!(controller.sweep_expired(), 1);
        assert_eq!(controller.window_count(), 1);
    }

    #[test]
    fn test_client_key_derivation() {
        let from_key = ClientKey::from_api_key("abc");
        let from_ip = ClientKey::from_addr("127.0.0.1".parse().unwrap());
        assert_eq!(from_key.as_str(), "key:abc");
        assert_eq!(from_ip.as_str(), "ip:127.0.0.1");
        assert_ne!(from_key, from_ip);
    }
}
