//! Typed control-plane commands.

use serde::Deserialize;

use super::job::JobId;

/// A command received on the control exchange.
///
/// The worker only acts on `cancel_job`; other command types are decoded
/// but ignored so the control exchange can grow without breaking older
/// workers.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    CancelJob {
        job_id: JobId,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ControlCommand {
    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}
