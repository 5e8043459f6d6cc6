use anyhow::{Context, Result};
use figment::providers::{Env, Serialized};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::{Config, ProviderConfig};

/// Environment keys the loader recognizes for the worker itself.
/// Backend-specific keys live under `PROVIDER_CONFIG_*`.
const RECOGNIZED_KEYS: &[&str] = &[
    "POOL_SIZE",
    "QUEUE_NAME",
    "AMQP_URI",
    "BUILD_API_URI",
    "PROVIDER_NAME",
    "HARD_TIMEOUT",
    "LOG_TIMEOUT",
    "SCRIPT_UPLOAD_TIMEOUT",
    "STARTUP_TIMEOUT",
    "SHUTDOWN_TIMEOUT",
    "STOP_RETRIES",
    "STOP_RETRY_INTERVAL",
    "LOGS_QUEUE_NAME",
    "LOG_LEVEL",
    "LOG_FORMAT",
];

/// Environment prefix for backend-specific options.
pub const PROVIDER_CONFIG_PREFIX: &str = "PROVIDER_CONFIG_";

/// Configuration error types. All of these are fatal for the daemon.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid POOL_SIZE: {0}. Must be between 1 and 100")]
    InvalidPoolSize(usize),

    #[error("QUEUE_NAME cannot be empty")]
    EmptyQueueName,

    #[error("AMQP_URI cannot be empty")]
    EmptyAmqpUri,

    #[error("BUILD_API_URI is required")]
    MissingBuildApiUri,

    #[error("Invalid STOP_RETRIES: {0}. Cannot be 0")]
    InvalidStopRetries(u32),

    #[error("Invalid HARD_TIMEOUT: {0}. Must be positive")]
    InvalidHardTimeout(u64),

    #[error("Invalid LOG_TIMEOUT: {0}. Must be positive")]
    InvalidLogTimeout(u64),

    #[error("Invalid LOG_LEVEL: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid LOG_FORMAT: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),
}

/// Loads the worker configuration from the process environment.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration: programmatic defaults overridden by the
    /// recognized environment keys.
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Env::raw().only(RECOGNIZED_KEYS))
            .extract()
            .context("failed to extract configuration from environment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Collect backend options from `PROVIDER_CONFIG_*`.
    pub fn provider_config() -> ProviderConfig {
        ProviderConfig::from_env(PROVIDER_CONFIG_PREFIX)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.pool_size == 0 || config.pool_size > 100 {
            return Err(ConfigError::InvalidPoolSize(config.pool_size));
        }

        if config.queue_name.is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }

        if config.amqp_uri.is_empty() {
            return Err(ConfigError::EmptyAmqpUri);
        }

        if config.build_api_uri.is_empty() {
            return Err(ConfigError::MissingBuildApiUri);
        }

        if config.stop_retries == 0 {
            return Err(ConfigError::InvalidStopRetries(config.stop_retries));
        }

        if config.hard_timeout == 0 {
            return Err(ConfigError::InvalidHardTimeout(config.hard_timeout));
        }

        if config.log_timeout == 0 {
            return Err(ConfigError::InvalidLogTimeout(config.log_timeout));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.log_level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.log_format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.log_format.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            build_api_uri: "https://build-api.example.com/script".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_validate_accepts_defaults_with_build_api() {
        assert!(ConfigLoader::validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_build_api() {
        let config = Config::default();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::MissingBuildApiUri)
        ));
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = Config {
            pool_size: 0,
            ..valid_config()
        };
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidPoolSize(0))
        ));
    }

    #[test]
    fn test_validate_rejects_oversized_pool() {
        let config = Config {
            pool_size: 101,
            ..valid_config()
        };
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let config = Config {
            log_level: "verbose".to_string(),
            ..valid_config()
        };
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_stop_retries() {
        let config = Config {
            stop_retries: 0,
            ..valid_config()
        };
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidStopRetries(0))
        ));
    }
}
