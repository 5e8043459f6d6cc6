//! Log sink port - where live job output goes.

use async_trait::async_trait;

use crate::domain::models::job::JobId;

/// Receives a job's output stream as it is produced.
///
/// Implementations must not block the processor for long: a slow sink is
/// allowed to drop parts, never to stall the build.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append a chunk of combined stdout+stderr output.
    async fn append(&self, job_id: JobId, chunk: &[u8]);

    /// Mark the job's log as complete. Called exactly once per job that
    /// produced output.
    async fn finalize(&self, job_id: JobId);
}
