//! Logger initialization using tracing.

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::domain::models::Config;

/// Initialize the global tracing subscriber from the worker config.
///
/// `RUST_LOG` still wins over the configured default level, so operators
/// can raise verbosity per target without touching worker config.
pub fn init(config: &Config) -> Result<()> {
    let default_level = parse_log_level(&config.log_level)?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    match config.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_current_span(true)
                .init();
        }
    }

    tracing::info!(
        level = %config.log_level,
        format = %config.log_format,
        "logger initialized"
    );

    Ok(())
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!("Invalid log level: {level}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("info"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(parse_log_level("loud").is_err());
    }
}
