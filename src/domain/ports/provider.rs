//! Provider port - interface for machine backends.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::ProviderError;
use crate::domain::models::job::Job;

/// Attributes a backend may consult when choosing what to boot.
#[derive(Debug, Clone, Default)]
pub struct StartAttributes {
    pub job_id: u64,
    pub language: Option<String>,
    pub image_name: Option<String>,
}

impl StartAttributes {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id.0,
            language: job.language().map(str::to_string),
            image_name: job.image_name.clone(),
        }
    }
}

/// Result of running the build script to a normal exit.
///
/// A non-zero exit code is still a completed run; only infrastructure
/// failures surface as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub completed: bool,
    pub exit_code: i32,
}

/// Trait for machine provider backends.
///
/// A provider can boot an ephemeral instance per build job. If `start`
/// returns an error, the backend must have already released everything it
/// allocated along the way.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry key of the backend.
    fn name(&self) -> &'static str;

    /// One-shot initialization; failure here is fatal for the daemon.
    async fn setup(&self, token: &CancellationToken) -> Result<(), ProviderError>;

    /// Provision an instance and wait until it is reachable.
    async fn start(
        &self,
        token: &CancellationToken,
        attrs: &StartAttributes,
    ) -> Result<Box<dyn Instance>, ProviderError>;

    /// Whether `start` can report provisioning progress.
    fn supports_progress(&self) -> bool {
        false
    }

    /// Provision with coarse progress updates. Backends without progress
    /// support fall through to `start`.
    async fn start_with_progress(
        &self,
        token: &CancellationToken,
        attrs: &StartAttributes,
        _progress: &dyn ProgressReporter,
    ) -> Result<Box<dyn Instance>, ProviderError> {
        self.start(token, attrs).await
    }
}

/// Receives coarse provisioning progress updates.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, message: &str);
}

/// A live machine provisioned for exactly one job.
///
/// Every instance handed out by a successful `Provider::start` must see
/// exactly one successful `stop`, regardless of how execution ends.
#[async_trait]
pub trait Instance: Send + Sync {
    /// Install the build script on the instance.
    async fn upload_script(
        &self,
        token: &CancellationToken,
        script: &[u8],
    ) -> Result<(), ProviderError>;

    /// Execute the uploaded script, streaming combined stdout+stderr
    /// chunks through `output` as they are produced.
    ///
    /// Cancelling `token` must kill the remote process and return
    /// promptly.
    async fn run_script(
        &self,
        token: &CancellationToken,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<RunResult, ProviderError>;

    /// Fetch the build trace, if the backend records one.
    async fn download_trace(&self, _token: &CancellationToken) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::TraceNotImplemented)
    }

    /// Destroy the machine and all side resources.
    ///
    /// Must be idempotent and converge: repeated calls eventually observe
    /// the resources as gone.
    async fn stop(&self, token: &CancellationToken) -> Result<(), ProviderError>;

    fn id(&self) -> String;

    fn image_name(&self) -> String;

    fn startup_duration(&self) -> Duration;

    /// Whether the machine came from a warm pool.
    fn warmed(&self) -> bool {
        false
    }
}
