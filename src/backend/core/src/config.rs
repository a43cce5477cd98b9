//! Configuration management.
//!
//! Every tunable of the core is supplied externally: file and environment
//! sources are merged by the `config` crate, with `LIMN__`-prefixed
//! environment variables taking precedence (e.g.
//! `LIMN__SCHEDULER__MAX_CONCURRENT_JOBS=8`).

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionConfig;
use crate::executor::RetryPolicy;
use crate::jobs::{ProviderConfig, SchedulerConfig};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Job scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Admission (rate limiting) configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Retry policy for downstream provider calls
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Downstream AI provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_json_logging() -> bool {
    true
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("LIMN").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.retry.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("LIMN").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.retry.validate()?;
        Ok(cfg)
    }
}
