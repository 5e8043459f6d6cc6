//! Log sink that streams job output to the reporting queue.
//!
//! Output is published as ordered parts `{id, log, number, final}`; the
//! consumer on the other side reassembles them by number. Publishing is
//! best-effort: a failed part is logged and dropped, never allowed to
//! stall the build.

use async_trait::async_trait;
use chrono::Utc;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

use crate::domain::models::job::JobId;
use crate::domain::ports::LogSink;

pub struct AmqpLogSink {
    channel: Channel,
    queue_name: String,
    part_numbers: Mutex<HashMap<JobId, u64>>,
}

impl AmqpLogSink {
    pub fn new(channel: Channel, queue_name: impl Into<String>) -> Self {
        Self {
            channel,
            queue_name: queue_name.into(),
            part_numbers: Mutex::new(HashMap::new()),
        }
    }

    fn next_part(&self, job_id: JobId) -> u64 {
        let mut numbers = self.part_numbers.lock().unwrap();
        let counter = numbers.entry(job_id).or_insert(0);
        let number = *counter;
        *counter += 1;
        number
    }

    async fn publish(&self, job_id: JobId, log: &str, number: u64, is_final: bool) {
        let payload = serde_json::json!({
            "id": job_id.0,
            "log": log,
            "number": number,
            "final": is_final,
            "emitted_at": Utc::now().to_rfc3339(),
        });

        let result = self
            .channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                payload.to_string().as_bytes(),
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await;

        if let Err(e) = result {
            warn!(job_id = %job_id, error = %e, "failed to publish log part");
        }
    }
}

#[async_trait]
impl LogSink for AmqpLogSink {
    async fn append(&self, job_id: JobId, chunk: &[u8]) {
        let number = self.next_part(job_id);
        let log = String::from_utf8_lossy(chunk);
        self.publish(job_id, &log, number, false).await;
    }

    async fn finalize(&self, job_id: JobId) {
        let number = self.next_part(job_id);
        self.publish(job_id, "", number, true).await;
        self.part_numbers.lock().unwrap().remove(&job_id);
    }
}
