//! Processor pool: owns N processors and their shared lifecycle.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::dispatcher::CommandDispatcher;
use crate::application::processor::Processor;
use crate::domain::errors::QueueError;
use crate::domain::models::Config;
use crate::domain::ports::{BuildScriptGenerator, JobQueue, LogSink, MetricsSink, Provider};

/// Fixed-size pool of processors over one broker subscription.
///
/// `run` blocks until every processor has exited. `graceful_shutdown` can
/// be called concurrently from a signal handler; it is idempotent, stops
/// new deliveries, and returns once in-flight jobs have finished (or the
/// wait budget ran out).
pub struct ProcessorPool {
    queue: Arc<dyn JobQueue>,
    provider: Arc<dyn Provider>,
    generator: Arc<dyn BuildScriptGenerator>,
    log_sink: Arc<dyn LogSink>,
    metrics: Arc<dyn MetricsSink>,
    dispatcher: Arc<CommandDispatcher>,
    config: Config,
    graceful: CancellationToken,
    hard_stop: CancellationToken,
    done_tx: watch::Sender<bool>,
}

impl ProcessorPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        provider: Arc<dyn Provider>,
        generator: Arc<dyn BuildScriptGenerator>,
        log_sink: Arc<dyn LogSink>,
        metrics: Arc<dyn MetricsSink>,
        dispatcher: Arc<CommandDispatcher>,
        config: Config,
    ) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            queue,
            provider,
            generator,
            log_sink,
            metrics,
            dispatcher,
            config,
            graceful: CancellationToken::new(),
            hard_stop: CancellationToken::new(),
            done_tx,
        }
    }

    /// Start `size` processors and block until all have exited.
    ///
    /// A broker failure is not retried here: the pool shuts down and
    /// surfaces the first error to the caller.
    pub async fn run(&self, size: usize) -> Result<()> {
        self.provider
            .setup(&self.hard_stop)
            .await
            .context("provider setup failed")?;

        let mut workers: JoinSet<Result<(), QueueError>> = JoinSet::new();
        for _ in 0..size {
            self.spawn_processor(&mut workers)
                .await
                .context("failed to subscribe processor")?;
        }

        info!(
            pool_size = size,
            provider = self.provider.name(),
            "processor pool running"
        );

        let mut first_err: Option<QueueError> = None;
        let mut draining = false;
        let mut hard_stopped = false;
        let drain_budget = tokio::time::sleep(Duration::from_secs(3600 * 24 * 365));
        let mut drain_budget = std::pin::pin!(drain_budget);

        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "processor lost the broker, shutting pool down");
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                        let _ = self.queue.close().await;
                        self.graceful.cancel();
                    }
                    Some(Err(join_err)) if join_err.is_panic() => {
                        error!("processor panicked");
                        if !self.graceful.is_cancelled() {
                            if let Err(e) = self.spawn_processor(&mut workers).await {
                                warn!(error = %e, "could not replace panicked processor");
                            }
                        }
                    }
                    Some(Err(_)) => {}
                },
                _ = self.graceful.cancelled(), if !draining => {
                    draining = true;
                    drain_budget
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.config.shutdown_timeout());
                    info!(
                        budget_secs = self.config.shutdown_timeout,
                        "draining in-flight jobs"
                    );
                }
                _ = &mut drain_budget, if draining => {
                    if !hard_stopped {
                        warn!("shutdown wait budget exhausted, abandoning in-flight jobs");
                        self.hard_stop.cancel();
                        hard_stopped = true;
                        // Short grace for processors to observe the hard stop.
                        drain_budget
                            .as_mut()
                            .reset(tokio::time::Instant::now() + Duration::from_secs(5));
                    } else {
                        warn!("some processors did not observe the hard stop in time");
                        break;
                    }
                }
            }
        }

        let _ = self.done_tx.send(true);
        info!("processor pool stopped");

        match first_err {
            Some(e) => Err(e).context("broker subscription failed"),
            None => Ok(()),
        }
    }

    async fn spawn_processor(&self, workers: &mut JoinSet<Result<(), QueueError>>) -> Result<(), QueueError> {
        let stream = self.queue.subscribe().await?;
        let processor = Processor::new(
            stream,
            Arc::clone(&self.provider),
            Arc::clone(&self.generator),
            Arc::clone(&self.log_sink),
            Arc::clone(&self.metrics),
            Arc::clone(&self.dispatcher),
            self.config.clone(),
            self.graceful.clone(),
            self.hard_stop.clone(),
        );
        workers.spawn(processor.run());
        Ok(())
    }

    /// Stop accepting new work and wait for in-flight jobs to complete.
    ///
    /// Safe to call concurrently and more than once.
    pub async fn graceful_shutdown(&self) {
        if !self.graceful.is_cancelled() {
            info!("starting graceful shutdown");
        }
        let _ = self.queue.close().await;
        self.graceful.cancel();

        let mut done = self.done_tx.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Cancel in-flight work immediately. Cleanup contexts derive from
    /// this token, so a hard stop also abandons teardown.
    pub fn hard_shutdown(&self) {
        warn!("hard stop requested, cancelling in-flight jobs");
        self.graceful.cancel();
        self.hard_stop.cancel();
    }
}
