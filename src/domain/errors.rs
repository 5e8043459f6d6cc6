//! Error types for the worker's external boundaries.
//!
//! Every boundary (provider, queue, script generator) returns a structured
//! error; the processor decides between ack, requeue and cleanup escalation
//! based on where in the job lifecycle the error occurred.

use thiserror::Error;

/// Errors surfaced by provider backends and their instances.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider is not configured: {0}")]
    NotConfigured(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("transient infrastructure error: {0}")]
    Transient(String),

    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("script upload failed: {0}")]
    UploadFailed(String),

    #[error("script execution failed: {0}")]
    ExecutionFailed(String),

    #[error("instance teardown failed: {0}")]
    StopFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("trace download is not implemented by this backend")]
    TraceNotImplemented,
}

/// Errors surfaced by the job queue and delivery handles.
///
/// A deliberately closed subscription is not an error: streams signal it
/// by yielding `None`.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("delivery could not be acknowledged: {0}")]
    Disposition(String),
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        QueueError::Broker(err.to_string())
    }
}

/// Errors surfaced by the build script generator.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script API request failed: {0}")]
    Request(String),

    #[error("script API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generated script is empty")]
    Empty,
}
