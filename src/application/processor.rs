//! Processor: one worker's job lifecycle state machine.
//!
//! A processor pulls one job at a time from its delivery channel and
//! drives it through provision -> run -> teardown. Within one processor
//! transitions are strictly sequential; across processors they are fully
//! independent.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::dispatcher::{CancellationGuard, CommandDispatcher};
use crate::domain::errors::{ProviderError, QueueError};
use crate::domain::models::job::{Disposition, Job, JobId, JobOutcome};
use crate::domain::models::Config;
use crate::domain::ports::{
    BuildScriptGenerator, Delivery, Instance, JobStream, LogSink, MetricsSink, ProgressReporter,
    Provider, RunResult, StartAttributes,
};
use crate::infrastructure::retry::RetryPolicy;

/// Observable processor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Receiving,
    Provisioning,
    Running,
    Cleaning,
    Stopping,
}

/// Why the work context was cancelled. First cause wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelCause {
    Operator,
    HardTimeout,
    LogSilence,
    StartupTimeout,
    UploadTimeout,
    Shutdown,
}

#[derive(Clone, Default)]
struct CauseCell(Arc<Mutex<Option<CancelCause>>>);

impl CauseCell {
    fn set(&self, cause: CancelCause) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(cause);
        }
    }

    fn get(&self) -> Option<CancelCause> {
        *self.0.lock().unwrap()
    }
}

/// Per-worker state machine over one delivery channel.
pub struct Processor {
    id: Uuid,
    stream: Box<dyn JobStream>,
    provider: Arc<dyn Provider>,
    generator: Arc<dyn BuildScriptGenerator>,
    log_sink: Arc<dyn LogSink>,
    metrics: Arc<dyn MetricsSink>,
    dispatcher: Arc<CommandDispatcher>,
    config: Config,
    /// Stop accepting new work; the current job still completes.
    graceful: CancellationToken,
    /// Cancel in-flight work. Cleanup derives from this token alone.
    hard_stop: CancellationToken,
    state_tx: watch::Sender<ProcessorState>,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: Box<dyn JobStream>,
        provider: Arc<dyn Provider>,
        generator: Arc<dyn BuildScriptGenerator>,
        log_sink: Arc<dyn LogSink>,
        metrics: Arc<dyn MetricsSink>,
        dispatcher: Arc<CommandDispatcher>,
        config: Config,
        graceful: CancellationToken,
        hard_stop: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProcessorState::Idle);
        Self {
            id: Uuid::new_v4(),
            stream,
            provider,
            generator,
            log_sink,
            metrics,
            dispatcher,
            config,
            graceful,
            hard_stop,
            state_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Watch the processor's lifecycle state.
    pub fn state_watch(&self) -> watch::Receiver<ProcessorState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ProcessorState) {
        let _ = self.state_tx.send(state);
    }

    /// Main loop: pull one job at a time until the subscription closes or
    /// the pool asks us to stop.
    pub async fn run(mut self) -> Result<(), QueueError> {
        info!(processor_id = %self.id, "processor started");
        let graceful = self.graceful.clone();

        loop {
            self.set_state(ProcessorState::Idle);

            let delivery = tokio::select! {
                biased;
                _ = graceful.cancelled() => break,
                next = self.stream.next() => next,
            };

            let delivery = match delivery {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    debug!(processor_id = %self.id, "delivery channel closed");
                    break;
                }
                Err(e) => {
                    if self.graceful.is_cancelled() {
                        break;
                    }
                    error!(processor_id = %self.id, error = %e, "broker stream failed");
                    self.set_state(ProcessorState::Stopping);
                    return Err(e);
                }
            };

            self.process_delivery(delivery).await;
        }

        self.set_state(ProcessorState::Stopping);
        info!(processor_id = %self.id, "processor stopped");
        Ok(())
    }

    async fn process_delivery(&mut self, delivery: Delivery) {
        self.set_state(ProcessorState::Receiving);

        let job = match Job::from_bytes(&delivery.body) {
            Ok(job) => job,
            Err(e) => {
                warn!(processor_id = %self.id, error = %e, "dropping unparseable delivery");
                self.metrics.mark("worker.job.parse_error");
                if let Err(e) = delivery.handle.nack(false).await {
                    warn!(error = %e, "failed to drop delivery");
                }
                return;
            }
        };

        let guard = match self.dispatcher.register(job.id) {
            Ok(guard) => guard,
            Err(e) => {
                // The same job is already in flight here; hand the
                // duplicate back to the broker.
                warn!(processor_id = %self.id, error = %e, "duplicate delivery, requeueing");
                if let Err(e) = delivery.handle.nack(true).await {
                    warn!(error = %e, "failed to requeue duplicate delivery");
                }
                return;
            }
        };

        info!(
            processor_id = %self.id,
            job_id = %job.id,
            repository = job.repository.as_deref().unwrap_or("unknown"),
            "processing job"
        );

        let outcome = self.execute_job(&job, &guard).await;

        match outcome.disposition() {
            Disposition::Ack => {
                if let Err(e) = delivery.handle.ack().await {
                    warn!(job_id = %job.id, error = %e, "failed to ack delivery");
                }
            }
            Disposition::Requeue => {
                if let Err(e) = delivery.handle.nack(true).await {
                    warn!(job_id = %job.id, error = %e, "failed to requeue delivery");
                }
            }
        }

        self.metrics.mark(outcome.metric());
        info!(processor_id = %self.id, job_id = %job.id, outcome = ?outcome, "job finished");
        drop(guard);
    }

    /// Drive one job through provision -> run -> teardown and decide its
    /// outcome. Every path through here ends with the instance stopped
    /// (or escalated as a leak) before the outcome is returned.
    async fn execute_job(&self, job: &Job, guard: &CancellationGuard) -> JobOutcome {
        let work = self.hard_stop.child_token();
        let cause = CauseCell::default();
        let job_started = Instant::now();

        let watchdog = self.spawn_job_watchdog(job, guard, &work, &cause);

        // The script is a pure function of the payload; generate it before
        // paying for a machine.
        let script = match self.generator.generate(job).await {
            Ok(script) => script,
            Err(e) => {
                watchdog.abort();
                return JobOutcome::Errored {
                    message: format!("script generation failed: {e}"),
                };
            }
        };

        self.set_state(ProcessorState::Provisioning);
        let attrs = StartAttributes::for_job(job);
        let progress = ProvisioningProgress { job_id: job.id };
        let start_result = self
            .with_phase_deadline(
                self.config.startup_timeout(),
                &work,
                &cause,
                CancelCause::StartupTimeout,
                async {
                    if self.provider.supports_progress() {
                        self.provider
                            .start_with_progress(&work, &attrs, &progress)
                            .await
                    } else {
                        self.provider.start(&work, &attrs).await
                    }
                },
            )
            .await;

        let instance = match start_result {
            Ok(instance) => instance,
            Err(e) => {
                watchdog.abort();
                // Start self-cleans; there is no instance to stop.
                return match cause.get() {
                    Some(CancelCause::Operator) => JobOutcome::Cancelled {
                        reason: guard.reason(),
                    },
                    Some(CancelCause::HardTimeout) => JobOutcome::TimedOut,
                    _ => JobOutcome::Errored {
                        message: format!("provisioning failed: {e}"),
                    },
                };
            }
        };

        info!(
            job_id = %job.id,
            instance_id = %instance.id(),
            image = %instance.image_name(),
            startup_secs = instance.startup_duration().as_secs_f64(),
            "instance ready"
        );
        self.metrics
            .timing("worker.job.startup_time", instance.startup_duration());

        let run_outcome = self
            .run_build(job, guard, &work, &cause, instance.as_ref(), &script, job_started)
            .await;

        watchdog.abort();
        self.clean_up(job, instance.as_ref()).await;
        run_outcome
    }

    /// Upload and execute the script, forwarding output to the log sink
    /// while the silence and hard-timeout watchdogs run alongside.
    #[allow(clippy::too_many_arguments)]
    async fn run_build(
        &self,
        job: &Job,
        guard: &CancellationGuard,
        work: &CancellationToken,
        cause: &CauseCell,
        instance: &dyn Instance,
        script: &[u8],
        job_started: Instant,
    ) -> JobOutcome {
        self.set_state(ProcessorState::Running);

        let upload_result = self
            .with_phase_deadline(
                self.config.script_upload_timeout(),
                work,
                cause,
                CancelCause::UploadTimeout,
                instance.upload_script(work, script),
            )
            .await;

        if let Err(e) = upload_result {
            return self.map_failure(guard, cause, e);
        }

        let log_silence = self.effective_log_silence(job);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        let mut run_fut = std::pin::pin!(instance.run_script(work, tx));
        let mut run_result: Option<Result<RunResult, ProviderError>> = None;
        let mut wrote_output = false;

        loop {
            tokio::select! {
                result = &mut run_fut, if run_result.is_none() => {
                    run_result = Some(result);
                }
                chunk = tokio::time::timeout(log_silence, rx.recv()) => match chunk {
                    Ok(Some(bytes)) => {
                        wrote_output = true;
                        self.log_sink.append(job.id, &bytes).await;
                    }
                    Ok(None) => {
                        // Output channel closed; the run future resolves
                        // next if it hasn't already.
                        if run_result.is_none() {
                            run_result = Some((&mut run_fut).await);
                        }
                        break;
                    }
                    Err(_) => {
                        warn!(job_id = %job.id, "no log output within budget, job stalled");
                        cause.set(CancelCause::LogSilence);
                        work.cancel();
                    }
                },
            }
        }

        if wrote_output {
            self.log_sink.finalize(job.id).await;
        }

        debug!(
            job_id = %job.id,
            elapsed_secs = job_started.elapsed().as_secs_f64(),
            "script run finished"
        );

        match run_result.expect("run loop exits only with a result") {
            Ok(RunResult { completed: true, exit_code }) => JobOutcome::Completed { exit_code },
            Ok(RunResult { completed: false, .. }) => match cause.get() {
                Some(_) => self.map_failure(guard, cause, ProviderError::Cancelled),
                None => JobOutcome::Errored {
                    message: "script did not complete".to_string(),
                },
            },
            Err(e) => self.map_failure(guard, cause, e),
        }
    }

    /// Teardown under a fresh context so cleanup survives whatever
    /// cancelled the work. Bounded retries; persistent failure is a leak,
    /// logged and counted, but never blocks the ack.
    async fn clean_up(&self, job: &Job, instance: &dyn Instance) {
        self.set_state(ProcessorState::Cleaning);

        let cleanup = self.hard_stop.child_token();
        let policy = RetryPolicy::new(self.config.stop_retries, self.config.stop_retry_interval());

        let result = policy
            .run(&cleanup, |attempt| {
                let cleanup = cleanup.clone();
                async move {
                    debug!(attempt, "stopping instance");
                    instance.stop(&cleanup).await
                }
            })
            .await;

        match result {
            Ok(()) => {
                debug!(job_id = %job.id, instance_id = %instance.id(), "instance stopped");
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    instance_id = %instance.id(),
                    error = %e,
                    "instance teardown failed, resource may be leaked"
                );
                self.metrics.mark("worker.job.cleanup_leak");
            }
        }
    }

    /// Map a failed provider call to the job outcome the cancel cause
    /// dictates.
    fn map_failure(
        &self,
        guard: &CancellationGuard,
        cause: &CauseCell,
        error: ProviderError,
    ) -> JobOutcome {
        match cause.get() {
            Some(CancelCause::Operator) => JobOutcome::Cancelled {
                reason: guard.reason(),
            },
            Some(CancelCause::HardTimeout) => JobOutcome::TimedOut,
            Some(CancelCause::LogSilence) => JobOutcome::Stalled,
            Some(CancelCause::Shutdown) => JobOutcome::Errored {
                message: "worker shutting down".to_string(),
            },
            Some(CancelCause::StartupTimeout) => JobOutcome::Errored {
                message: "provisioning timed out".to_string(),
            },
            Some(CancelCause::UploadTimeout) => JobOutcome::Errored {
                message: "script upload timed out".to_string(),
            },
            None => JobOutcome::Errored {
                message: error.to_string(),
            },
        }
    }

    /// Job-scoped watchdog: cancels the work context on operator cancel,
    /// hard timeout, or pool hard-stop, recording which fired first.
    fn spawn_job_watchdog(
        &self,
        job: &Job,
        guard: &CancellationGuard,
        work: &CancellationToken,
        cause: &CauseCell,
    ) -> JoinHandle<()> {
        let cancel = guard.token().clone();
        let hard_stop = self.hard_stop.clone();
        let work = work.clone();
        let cause = cause.clone();
        let hard_timeout = self.effective_hard_timeout(job);
        let job_id = job.id;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(job_id = %job_id, "cancellation requested");
                    cause.set(CancelCause::Operator);
                }
                _ = tokio::time::sleep(hard_timeout) => {
                    warn!(job_id = %job_id, timeout_secs = hard_timeout.as_secs(), "hard timeout expired");
                    cause.set(CancelCause::HardTimeout);
                }
                _ = hard_stop.cancelled() => {
                    cause.set(CancelCause::Shutdown);
                }
            }
            work.cancel();
        })
    }

    /// Run `fut` while a phase deadline is armed against the work token.
    /// The future itself is never dropped mid-flight; expiry flows
    /// through the token so the callee can clean up before returning.
    async fn with_phase_deadline<T>(
        &self,
        deadline: Duration,
        work: &CancellationToken,
        cause: &CauseCell,
        on_expiry: CancelCause,
        fut: impl std::future::Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        let timer = {
            let work = work.clone();
            let cause = cause.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                cause.set(on_expiry);
                work.cancel();
            })
        };
        let result = fut.await;
        timer.abort();
        result
    }

    fn effective_hard_timeout(&self, job: &Job) -> Duration {
        if job.timeouts.hard_limit > 0 {
            Duration::from_secs(job.timeouts.hard_limit)
        } else {
            self.config.hard_timeout()
        }
    }

    fn effective_log_silence(&self, job: &Job) -> Duration {
        if job.timeouts.log_silence > 0 {
            Duration::from_secs(job.timeouts.log_silence)
        } else {
            self.config.log_timeout()
        }
    }
}

/// Forwards backend provisioning progress into the worker log.
struct ProvisioningProgress {
    job_id: JobId,
}

impl ProgressReporter for ProvisioningProgress {
    fn report(&self, message: &str) {
        info!(job_id = %self.job_id, "{}", message);
    }
}

