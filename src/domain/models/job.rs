//! Build job payload and terminal outcome.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Unique, stable identifier assigned to a job by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-job execution budgets, in seconds. Zero means "use the worker
/// default".
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct JobTimeouts {
    #[serde(default)]
    pub hard_limit: u64,
    #[serde(default)]
    pub log_silence: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct JobMeta {
    id: u64,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    commit: Option<String>,
    #[serde(default)]
    branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RepositoryMeta {
    #[serde(default)]
    slug: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ImageMeta {
    #[serde(default)]
    name: Option<String>,
}

/// Raw broker payload shape. Unknown fields are kept in the retained raw
/// value, not here.
#[derive(Debug, Clone, Deserialize)]
struct JobPayload {
    job: JobMeta,
    #[serde(default)]
    repository: Option<RepositoryMeta>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    timeouts: Option<JobTimeouts>,
    #[serde(default)]
    image: Option<ImageMeta>,
}

/// An immutable build job as delivered by the broker.
///
/// The typed fields are the ones the worker core consults; the full payload
/// is retained in `raw` and passed through opaquely (the script generator
/// receives it verbatim).
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub number: Option<String>,
    pub repository: Option<String>,
    pub commit: Option<String>,
    pub branch: Option<String>,
    /// Build configuration block (language, script inputs, ...).
    pub config: Value,
    pub timeouts: JobTimeouts,
    pub image_name: Option<String>,
    /// The complete payload as delivered.
    pub raw: Value,
}

impl Job {
    /// Parse a broker delivery body.
    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: Value = serde_json::from_slice(body)?;
        let payload: JobPayload = serde_json::from_value(raw.clone())?;

        Ok(Self {
            id: JobId(payload.job.id),
            number: payload.job.number,
            repository: payload.repository.and_then(|r| r.slug),
            commit: payload.job.commit,
            branch: payload.job.branch,
            config: payload.config.unwrap_or(Value::Null),
            timeouts: payload.timeouts.unwrap_or_default(),
            image_name: payload.image.and_then(|i| i.name),
            raw,
        })
    }

    /// The language requested by the build configuration, if any.
    pub fn language(&self) -> Option<&str> {
        self.config.get("language").and_then(Value::as_str)
    }
}

/// Broker-side terminal choice for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The job reached a terminal result on this worker.
    Ack,
    /// The job must be returned to the broker for another worker.
    Requeue,
}

/// How a job's execution ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The script ran to a normal exit, successful or not.
    Completed { exit_code: i32 },
    /// An operator cancelled the job while it was in flight.
    Cancelled { reason: Option<String> },
    /// The hard timeout expired.
    TimedOut,
    /// No output was observed within the log-silence budget.
    Stalled,
    /// Infrastructure failed before the script could complete.
    Errored { message: String },
}

impl JobOutcome {
    /// Errored jobs go back to the broker; everything else is final here.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Errored { .. } => Disposition::Requeue,
            _ => Disposition::Ack,
        }
    }

    /// Metric counter name recorded when the job reaches this outcome.
    pub fn metric(&self) -> &'static str {
        match self {
            Self::Completed { exit_code: 0 } => "worker.job.success",
            Self::Completed { .. } => "worker.job.failed",
            Self::Cancelled { .. } => "worker.job.cancelled",
            Self::TimedOut => "worker.job.timeout",
            Self::Stalled => "worker.job.stalled",
            Self::Errored { .. } => "worker.job.requeue",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_payload() {
        let body = serde_json::json!({
            "type": "test",
            "job": { "id": 1234, "number": "5.1", "commit": "abc123", "branch": "main" },
            "repository": { "id": 9, "slug": "owner/repo" },
            "config": { "language": "rust", "script": ["cargo test"] },
            "timeouts": { "hard_limit": 600, "log_silence": 120 },
            "image": { "name": "ubuntu-focal" },
            "queue": "builds.linux"
        });
        let job = Job::from_bytes(body.to_string().as_bytes()).unwrap();

        assert_eq!(job.id, JobId(1234));
        assert_eq!(job.repository.as_deref(), Some("owner/repo"));
        assert_eq!(job.language(), Some("rust"));
        assert_eq!(job.timeouts.hard_limit, 600);
        assert_eq!(job.image_name.as_deref(), Some("ubuntu-focal"));
        // Unknown fields survive in the raw payload.
        assert_eq!(job.raw["queue"], "builds.linux");
    }

    #[test]
    fn test_parse_minimal_payload() {
        let job = Job::from_bytes(br#"{"job":{"id":7}}"#).unwrap();
        assert_eq!(job.id, JobId(7));
        assert!(job.repository.is_none());
        assert_eq!(job.timeouts.hard_limit, 0);
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(Job::from_bytes(b"not json").is_err());
        assert!(Job::from_bytes(br#"{"no_job_key":true}"#).is_err());
    }

    #[test]
    fn test_outcome_dispositions() {
        assert_eq!(
            JobOutcome::Completed { exit_code: 1 }.disposition(),
            Disposition::Ack
        );
        assert_eq!(
            JobOutcome::Cancelled { reason: None }.disposition(),
            Disposition::Ack
        );
        assert_eq!(JobOutcome::TimedOut.disposition(), Disposition::Ack);
        assert_eq!(
            JobOutcome::Errored { message: "boom".into() }.disposition(),
            Disposition::Requeue
        );
    }

    #[test]
    fn test_outcome_metrics() {
        assert_eq!(
            JobOutcome::Completed { exit_code: 0 }.metric(),
            "worker.job.success"
        );
        assert_eq!(
            JobOutcome::Completed { exit_code: 2 }.metric(),
            "worker.job.failed"
        );
        assert_eq!(
            JobOutcome::Errored { message: String::new() }.metric(),
            "worker.job.requeue"
        );
    }
}
