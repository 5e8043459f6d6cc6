//! Worker configuration.
//!
//! All configuration comes in as a flat string-keyed mapping from the
//! process environment; field names map 1:1 onto the recognized keys
//! (`POOL_SIZE`, `QUEUE_NAME`, ...). Durations are seconds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration for the worker daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Number of processors in the pool (1-100)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Broker queue the pool consumes build jobs from
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// AMQP broker URI
    #[serde(default = "default_amqp_uri")]
    pub amqp_uri: String,

    /// Build-script generator endpoint
    #[serde(default)]
    pub build_api_uri: String,

    /// Provider backend registry key
    #[serde(default = "default_provider_name")]
    pub provider_name: String,

    /// Per-job hard budget, from job start, in seconds
    #[serde(default = "default_hard_timeout")]
    pub hard_timeout: u64,

    /// Maximum gap between output bytes before a job is declared stalled
    #[serde(default = "default_log_timeout")]
    pub log_timeout: u64,

    /// Budget for uploading the generated script to the instance
    #[serde(default = "default_script_upload_timeout")]
    pub script_upload_timeout: u64,

    /// Budget for Provider::start
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,

    /// How long graceful shutdown waits for in-flight jobs
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Instance::stop attempts before escalating a leak
    #[serde(default = "default_stop_retries")]
    pub stop_retries: u32,

    /// Seconds between Instance::stop attempts
    #[serde(default = "default_stop_retry_interval")]
    pub stop_retry_interval: u64,

    /// Optional queue for streaming log parts; unset streams to the
    /// process log instead
    #[serde(default)]
    pub logs_queue_name: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

const fn default_pool_size() -> usize {
    2
}

fn default_queue_name() -> String {
    "builds.linux".to_string()
}

fn default_amqp_uri() -> String {
    "amqp://127.0.0.1:5672/%2f".to_string()
}

fn default_provider_name() -> String {
    "docker".to_string()
}

const fn default_hard_timeout() -> u64 {
    3000
}

const fn default_log_timeout() -> u64 {
    600
}

const fn default_script_upload_timeout() -> u64 {
    120
}

const fn default_startup_timeout() -> u64 {
    240
}

const fn default_shutdown_timeout() -> u64 {
    300
}

const fn default_stop_retries() -> u32 {
    10
}

const fn default_stop_retry_interval() -> u64 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            queue_name: default_queue_name(),
            amqp_uri: default_amqp_uri(),
            build_api_uri: String::new(),
            provider_name: default_provider_name(),
            hard_timeout: default_hard_timeout(),
            log_timeout: default_log_timeout(),
            script_upload_timeout: default_script_upload_timeout(),
            startup_timeout: default_startup_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            stop_retries: default_stop_retries(),
            stop_retry_interval: default_stop_retry_interval(),
            logs_queue_name: None,
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout)
    }

    pub fn log_timeout(&self) -> Duration {
        Duration::from_secs(self.log_timeout)
    }

    pub fn script_upload_timeout(&self) -> Duration {
        Duration::from_secs(self.script_upload_timeout)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn stop_retry_interval(&self) -> Duration {
        Duration::from_secs(self.stop_retry_interval)
    }
}

/// Flat string map of backend-specific options.
///
/// Gathered from `PROVIDER_CONFIG_*` environment variables with the prefix
/// stripped; backends declare which keys they recognize through the
/// registry so the loader can warn about the rest.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    values: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Collect from the process environment, stripping `prefix`.
    pub fn from_env(prefix: &str) -> Self {
        let values = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix).map(|stripped| (stripped.to_string(), v))
            })
            .collect();
        Self { values }
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Required key, surfaced as a readable error when missing.
    pub fn require(&self, key: &str) -> Result<&str, crate::domain::errors::ProviderError> {
        self.get(key).ok_or_else(|| {
            crate::domain::errors::ProviderError::NotConfigured(format!(
                "missing required option {key}"
            ))
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}
