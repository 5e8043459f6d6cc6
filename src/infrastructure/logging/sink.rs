//! Log sink that forwards job output into the worker's own log stream.
//!
//! Used when no reporting queue is configured; every chunk becomes a log
//! line tagged with the job id.

use async_trait::async_trait;
use tracing::info;

use crate::domain::models::job::JobId;
use crate::domain::ports::LogSink;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn append(&self, job_id: JobId, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        for line in text.lines() {
            info!(target: "kiln::job_log", job_id = %job_id, "{}", line);
        }
    }

    async fn finalize(&self, job_id: JobId) {
        info!(target: "kiln::job_log", job_id = %job_id, "log complete");
    }
}
