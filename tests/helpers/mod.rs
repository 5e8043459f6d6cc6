//! Shared in-memory test doubles for pool-level tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use kiln::domain::errors::QueueError;
use kiln::domain::models::job::JobId;
use kiln::domain::models::Config;
use kiln::domain::ports::{
    BuildScriptGenerator, Delivery, DeliveryHandle, JobQueue, JobStream, LogSink,
};

/// Worker config with short budgets suitable for tests.
pub fn test_config() -> Config {
    Config {
        pool_size: 1,
        build_api_uri: "http://localhost/script".to_string(),
        hard_timeout: 60,
        log_timeout: 60,
        script_upload_timeout: 10,
        startup_timeout: 30,
        shutdown_timeout: 10,
        stop_retries: 3,
        stop_retry_interval: 0,
        ..Config::default()
    }
}

/// Minimal broker payload for a job id.
pub fn job_payload(id: u64) -> Vec<u8> {
    serde_json::json!({
        "job": { "id": id },
        "repository": { "slug": "owner/repo" },
        "config": { "language": "rust" },
    })
    .to_string()
    .into_bytes()
}

/// Payload with explicit per-job budgets (seconds).
pub fn job_payload_with_timeouts(id: u64, hard_limit: u64, log_silence: u64) -> Vec<u8> {
    serde_json::json!({
        "job": { "id": id },
        "timeouts": { "hard_limit": hard_limit, "log_silence": log_silence },
    })
    .to_string()
    .into_bytes()
}

/// Disposition counters for one delivery.
#[derive(Debug, Default)]
pub struct HandleState {
    pub acks: AtomicU32,
    pub requeues: AtomicU32,
    pub drops: AtomicU32,
}

impl HandleState {
    pub fn acks(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn requeues(&self) -> u32 {
        self.requeues.load(Ordering::SeqCst)
    }

    pub fn drops(&self) -> u32 {
        self.drops.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u32 {
        self.acks() + self.requeues() + self.drops()
    }
}

enum Queued {
    Job(Vec<u8>, Arc<HandleState>),
    BrokerFailure,
}

/// In-memory job queue with the same fan-out shape as the AMQP adapter:
/// every subscribed stream competes for the next queued delivery.
pub struct TestQueue {
    jobs: Mutex<VecDeque<Queued>>,
    closed: CancellationToken,
}

impl TestQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(VecDeque::new()),
            closed: CancellationToken::new(),
        })
    }

    /// Queue a delivery and return its disposition counters.
    pub async fn push(&self, body: Vec<u8>) -> Arc<HandleState> {
        let state = Arc::new(HandleState::default());
        self.jobs
            .lock()
            .await
            .push_back(Queued::Job(body, Arc::clone(&state)));
        state
    }

    /// Queue a broker failure; the stream that picks it up errors.
    pub async fn push_failure(&self) {
        self.jobs.lock().await.push_back(Queued::BrokerFailure);
    }

    fn close_now(&self) {
        self.closed.cancel();
    }
}

/// Arc wrapper so streams can share the queue.
pub struct TestQueueHandle(pub Arc<TestQueue>);

#[async_trait]
impl JobQueue for TestQueueHandle {
    async fn subscribe(&self) -> Result<Box<dyn JobStream>, QueueError> {
        Ok(Box::new(TestStream {
            queue: Arc::clone(&self.0),
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.0.close_now();
        Ok(())
    }
}

struct TestStream {
    queue: Arc<TestQueue>,
}

#[async_trait]
impl JobStream for TestStream {
    async fn next(&mut self) -> Result<Option<Delivery>, QueueError> {
        loop {
            if self.queue.closed.is_cancelled() {
                return Ok(None);
            }

            if let Some(queued) = self.queue.jobs.lock().await.pop_front() {
                return match queued {
                    Queued::Job(body, state) => Ok(Some(Delivery {
                        body,
                        handle: Box::new(TestHandle { state }),
                    })),
                    Queued::BrokerFailure => Err(QueueError::Broker("connection lost".into())),
                };
            }

            tokio::select! {
                _ = self.queue.closed.cancelled() => return Ok(None),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }
}

struct TestHandle {
    state: Arc<HandleState>,
}

#[async_trait]
impl DeliveryHandle for TestHandle {
    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        self.state.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            self.state.requeues.fetch_add(1, Ordering::SeqCst);
        } else {
            self.state.drops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Script generator returning a fixed script.
pub struct StaticGenerator(pub Vec<u8>);

impl StaticGenerator {
    pub fn shell(script: &str) -> Arc<Self> {
        Arc::new(Self(script.as_bytes().to_vec()))
    }
}

#[async_trait]
impl BuildScriptGenerator for StaticGenerator {
    async fn generate(
        &self,
        _job: &kiln::domain::models::job::Job,
    ) -> Result<Vec<u8>, kiln::domain::errors::ScriptError> {
        Ok(self.0.clone())
    }
}

/// Log sink that records every chunk per job.
#[derive(Default)]
pub struct RecordingLogSink {
    chunks: StdMutex<Vec<(JobId, Vec<u8>)>>,
    finals: AtomicU32,
}

impl RecordingLogSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn text_for(&self, job_id: JobId) -> String {
        self.chunks
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, chunk)| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    }

    pub fn finals(&self) -> u32 {
        self.finals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSink for RecordingLogSink {
    async fn append(&self, job_id: JobId, chunk: &[u8]) {
        self.chunks.lock().unwrap().push((job_id, chunk.to_vec()));
    }

    async fn finalize(&self, _job_id: JobId) {
        self.finals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `predicate` until it holds or the deadline passes.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within deadline");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
