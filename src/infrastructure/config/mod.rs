pub mod loader;

pub use loader::{ConfigError, ConfigLoader, PROVIDER_CONFIG_PREFIX};
