//! Command dispatcher: fan-out of control-plane commands to processors.
//!
//! The dispatcher owns the `JobID -> cancel signal` map. Processors
//! register a job when they begin it and the registration is removed on
//! the job's terminal state; a `cancel_job` command fires the signal for
//! the matching registration, or is dropped silently when no processor
//! here owns the job (the broker fans cancellations out to every worker).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::models::command::ControlCommand;
use crate::domain::models::job::JobId;

struct Registration {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

/// Single subscriber to the control exchange, dispatching to any
/// interested processor.
#[derive(Default)]
pub struct CommandDispatcher {
    registrations: Mutex<HashMap<JobId, Registration>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job for cancellation delivery.
    ///
    /// Returns a guard that deregisters on drop, so the registration
    /// cannot outlive the job on any exit path. At most one registration
    /// may exist per job.
    pub fn register(
        self: &Arc<Self>,
        job_id: JobId,
    ) -> Result<CancellationGuard, DuplicateRegistration> {
        let token = CancellationToken::new();
        let reason = Arc::new(Mutex::new(None));

        let mut map = self.registrations.lock().unwrap();
        if map.contains_key(&job_id) {
            return Err(DuplicateRegistration(job_id));
        }
        map.insert(
            job_id,
            Registration {
                token: token.clone(),
                reason: Arc::clone(&reason),
            },
        );
        drop(map);

        Ok(CancellationGuard {
            dispatcher: Arc::clone(self),
            job_id,
            token,
            reason,
        })
    }

    /// Fire the cancel signal for a job, if it is registered here.
    ///
    /// The signal is fired outside the map lock. Returns whether a
    /// registration was found.
    pub fn cancel(&self, job_id: JobId, reason: Option<String>) -> bool {
        let entry = {
            let mut map = self.registrations.lock().unwrap();
            map.remove(&job_id)
        };

        match entry {
            Some(registration) => {
                info!(job_id = %job_id, reason = ?reason, "cancelling job");
                *registration.reason.lock().unwrap() = reason;
                registration.token.cancel();
                true
            }
            None => {
                debug!(job_id = %job_id, "cancel for unknown job, dropping");
                false
            }
        }
    }

    fn deregister(&self, job_id: JobId) {
        self.registrations.lock().unwrap().remove(&job_id);
    }

    /// Number of live registrations. Used by shutdown accounting and
    /// tests.
    pub fn registered(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    /// Consume control commands until the channel closes.
    ///
    /// The broker subscription itself lives in the infrastructure layer
    /// and feeds this channel.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<ControlCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                ControlCommand::CancelJob { job_id, reason } => {
                    self.cancel(job_id, reason);
                }
                ControlCommand::Unknown => {
                    warn!("ignoring unrecognized control command");
                }
            }
        }
        debug!("control command channel closed");
    }
}

/// Duplicate registration for a job that is already in flight here.
#[derive(Debug, thiserror::Error)]
#[error("job {0} is already registered for cancellation")]
pub struct DuplicateRegistration(pub JobId);

/// Live cancel registration for one job.
///
/// Dropping the guard deregisters the job.
pub struct CancellationGuard {
    dispatcher: Arc<CommandDispatcher>,
    job_id: JobId,
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancellationGuard {
    /// The one-shot cancel signal for this job.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves when the job is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The reason supplied with the cancel command, once fired.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        self.dispatcher.deregister(self.job_id);
    }
}
