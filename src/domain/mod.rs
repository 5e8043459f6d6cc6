//! Domain layer for the Kiln build worker.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{ProviderError, QueueError, ScriptError};
