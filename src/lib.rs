//! Kiln - distributed CI build worker.

pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;

pub use domain::errors::{ProviderError, QueueError, ScriptError};
pub use domain::models::Config;
