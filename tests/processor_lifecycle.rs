//! Pool-level lifecycle scenarios against the mock backend.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::*;
use kiln::application::{CommandDispatcher, ProcessorPool};
use kiln::domain::models::job::JobId;
use kiln::domain::models::Config;
use kiln::domain::ports::{BuildScriptGenerator, LogSink, MetricsSink, Provider};
use kiln::infrastructure::backends::{MockBehavior, MockProvider};
use kiln::infrastructure::telemetry::InMemoryMetrics;

struct Harness {
    queue: Arc<TestQueue>,
    provider: Arc<MockProvider>,
    metrics: Arc<InMemoryMetrics>,
    sink: Arc<RecordingLogSink>,
    dispatcher: Arc<CommandDispatcher>,
    pool: Arc<ProcessorPool>,
    run: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    fn start(config: Config, behavior: MockBehavior) -> Self {
        let pool_size = config.pool_size;
        let queue = TestQueue::new();
        let provider = Arc::new(MockProvider::new());
        provider.set_behavior(behavior);
        let metrics = Arc::new(InMemoryMetrics::new());
        let sink = RecordingLogSink::new();
        let dispatcher = Arc::new(CommandDispatcher::new());

        let pool = Arc::new(ProcessorPool::new(
            Arc::new(TestQueueHandle(Arc::clone(&queue))),
            Arc::clone(&provider) as Arc<dyn Provider>,
            StaticGenerator::shell("#!/bin/bash\ntrue\n") as Arc<dyn BuildScriptGenerator>,
            Arc::clone(&sink) as Arc<dyn LogSink>,
            Arc::clone(&metrics) as Arc<dyn MetricsSink>,
            Arc::clone(&dispatcher),
            config,
        ));

        let run = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.run(pool_size).await }
        });

        Self {
            queue,
            provider,
            metrics,
            sink,
            dispatcher,
            pool,
            run,
        }
    }

    async fn shutdown(self) {
        self.pool.graceful_shutdown().await;
        self.run.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn s1_happy_path() {
    let h = Harness::start(test_config(), MockBehavior::default());

    let handle = h.queue.push(job_payload(11)).await;
    wait_until(|| handle.acks() == 1).await;

    assert_eq!(h.sink.text_for(JobId(11)), "ok\n");
    assert_eq!(h.sink.finals(), 1);
    assert_eq!(h.provider.starts(), 1);
    assert_eq!(h.provider.stops(), 1);
    assert_eq!(h.metrics.count("worker.job.success"), 1);
    assert_eq!(handle.total(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn s2_build_failure_is_still_a_completion() {
    let behavior = MockBehavior {
        exit_code: 1,
        ..Default::default()
    };
    let h = Harness::start(test_config(), behavior);

    let handle = h.queue.push(job_payload(21)).await;
    wait_until(|| handle.acks() == 1).await;

    assert_eq!(handle.requeues(), 0);
    assert_eq!(h.metrics.count("worker.job.failed"), 1);
    assert_eq!(h.metrics.count("worker.job.success"), 0);
    assert_eq!(h.provider.stops(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn s3_provision_failure_requeues() {
    let behavior = MockBehavior {
        fail_start: true,
        ..Default::default()
    };
    let h = Harness::start(test_config(), behavior);

    let handle = h.queue.push(job_payload(31)).await;
    wait_until(|| handle.requeues() == 1).await;

    // No instance was created, so nothing to stop.
    assert_eq!(h.provider.starts(), 0);
    assert_eq!(h.provider.stop_attempts(), 0);
    assert_eq!(h.metrics.count("worker.job.requeue"), 1);
    assert_eq!(handle.total(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn s4_cancel_mid_run() {
    let behavior = MockBehavior {
        script_output: vec![b"abc".to_vec()],
        hang_after_output: true,
        ..Default::default()
    };
    let h = Harness::start(test_config(), behavior);

    let handle = h.queue.push(job_payload(41)).await;
    wait_until(|| h.sink.text_for(JobId(41)) == "abc").await;

    assert!(h.dispatcher.cancel(JobId(41), Some("requested by user".into())));
    wait_until(|| handle.acks() == 1).await;

    assert_eq!(h.metrics.count("worker.job.cancelled"), 1);
    assert_eq!(h.provider.stops(), 1);
    assert_eq!(handle.total(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn s5_hard_timeout() {
    let behavior = MockBehavior {
        script_output: vec![b"building...\n".to_vec()],
        hang_after_output: true,
        ..Default::default()
    };
    let h = Harness::start(test_config(), behavior);

    let handle = h
        .queue
        .push(job_payload_with_timeouts(51, 1, 60))
        .await;
    wait_until(|| handle.acks() == 1).await;

    assert_eq!(h.metrics.count("worker.job.timeout"), 1);
    assert_eq!(h.provider.stops(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn log_silence_marks_job_stalled() {
    let behavior = MockBehavior {
        script_output: vec![b"last sign of life\n".to_vec()],
        hang_after_output: true,
        ..Default::default()
    };
    let h = Harness::start(test_config(), behavior);

    let handle = h
        .queue
        .push(job_payload_with_timeouts(61, 60, 1))
        .await;
    wait_until(|| handle.acks() == 1).await;

    assert_eq!(h.metrics.count("worker.job.stalled"), 1);
    assert_eq!(h.provider.stops(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn s6_graceful_shutdown_finishes_current_job() {
    let behavior = MockBehavior {
        script_output: vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()],
        chunk_interval: Duration::from_millis(300),
        ..Default::default()
    };
    let h = Harness::start(test_config(), behavior);

    let j1 = h.queue.push(job_payload(71)).await;
    let j2 = h.queue.push(job_payload(72)).await;

    wait_until(|| h.provider.starts() == 1).await;
    h.pool.graceful_shutdown().await;

    // j1 ran its full lifecycle; j2 was never claimed by this worker.
    assert_eq!(j1.acks(), 1);
    assert_eq!(j2.total(), 0);
    assert_eq!(h.provider.stops(), 1);
    assert_eq!(h.provider.live(), 0);
    assert_eq!(h.metrics.count("worker.job.success"), 1);

    h.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn progress_capable_backend_provisions_with_progress() {
    let behavior = MockBehavior {
        supports_progress: true,
        ..Default::default()
    };
    let h = Harness::start(test_config(), behavior);

    let handle = h.queue.push(job_payload(75)).await;
    wait_until(|| handle.acks() == 1).await;

    // The pool routed provisioning through start_with_progress.
    assert_eq!(h.provider.progress_reports(), 1);
    assert_eq!(h.metrics.count("worker.job.success"), 1);
    assert_eq!(h.provider.stops(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn unparseable_payload_is_dropped() {
    let h = Harness::start(test_config(), MockBehavior::default());

    let handle = h.queue.push(b"{not json".to_vec()).await;
    wait_until(|| handle.drops() == 1).await;

    assert_eq!(h.metrics.count("worker.job.parse_error"), 1);
    assert_eq!(h.provider.starts(), 0);
    assert_eq!(handle.total(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn teardown_failure_is_escalated_not_blocking() {
    let behavior = MockBehavior {
        // More stop failures than the configured retry budget.
        fail_stop_attempts: 5,
        ..Default::default()
    };
    let h = Harness::start(test_config(), behavior);

    let handle = h.queue.push(job_payload(81)).await;
    wait_until(|| handle.acks() == 1).await;

    assert_eq!(h.metrics.count("worker.job.cleanup_leak"), 1);
    assert_eq!(h.metrics.count("worker.job.success"), 1);
    assert_eq!(h.provider.stop_attempts(), 3);
    assert_eq!(h.provider.stops(), 0);

    h.shutdown().await;
}

#[tokio::test]
async fn duplicate_delivery_is_requeued() {
    let behavior = MockBehavior {
        script_output: vec![b"working\n".to_vec()],
        hang_after_output: true,
        ..Default::default()
    };
    let config = Config {
        pool_size: 2,
        ..test_config()
    };
    let h = Harness::start(config, behavior);

    let first = h.queue.push(job_payload(91)).await;
    wait_until(|| h.provider.starts() == 1).await;

    // The broker redelivers the same job while it is still in flight.
    let second = h.queue.push(job_payload(91)).await;
    wait_until(|| second.requeues() == 1).await;
    assert_eq!(first.total(), 0);

    h.dispatcher.cancel(JobId(91), None);
    wait_until(|| first.acks() == 1).await;

    h.shutdown().await;
}

#[tokio::test]
async fn broker_failure_surfaces_to_caller() {
    let h = Harness::start(test_config(), MockBehavior::default());

    h.queue.push_failure().await;

    let result = h.run.await.unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn resource_conservation_across_outcomes() {
    // Mixed bag of outcomes; every successful start must see a stop.
    let h = Harness::start(test_config(), MockBehavior::default());

    let ok = h.queue.push(job_payload(101)).await;
    wait_until(|| ok.acks() == 1).await;

    h.provider.set_behavior(MockBehavior {
        exit_code: 2,
        ..Default::default()
    });
    let failed = h.queue.push(job_payload(102)).await;
    wait_until(|| failed.acks() == 1).await;

    h.provider.set_behavior(MockBehavior {
        script_output: vec![b"x".to_vec()],
        hang_after_output: true,
        ..Default::default()
    });
    let cancelled = h.queue.push(job_payload(103)).await;
    wait_until(|| h.sink.text_for(JobId(103)) == "x").await;
    h.dispatcher.cancel(JobId(103), None);
    wait_until(|| cancelled.acks() == 1).await;

    assert_eq!(h.provider.starts(), 3);
    assert_eq!(h.provider.stops(), 3);
    assert_eq!(h.provider.live(), 0);

    let provider = Arc::clone(&h.provider);
    h.shutdown().await;

    // After shutdown no processor holds a live instance.
    assert_eq!(provider.live(), 0);
}
