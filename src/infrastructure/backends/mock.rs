//! In-process mock backend.
//!
//! Used by the test suite to script provisioning and execution behavior,
//! and by operators to smoke-test worker wiring without a real backend.
//! The provider counts starts and stops so tests can assert resource
//! conservation.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::ProviderError;
use crate::domain::ports::{Instance, ProgressReporter, Provider, RunResult, StartAttributes};

/// Scripted behavior for the next instances the mock starts.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Simulated provisioning time.
    pub start_delay: Duration,
    /// Fail provisioning after the delay.
    pub fail_start: bool,
    /// Output chunks the script produces, in order.
    pub script_output: Vec<Vec<u8>>,
    /// Pause between chunks.
    pub chunk_interval: Duration,
    /// Exit code of the script.
    pub exit_code: i32,
    /// After emitting the output, block until cancelled instead of
    /// exiting.
    pub hang_after_output: bool,
    /// Number of leading stop attempts that fail before one succeeds.
    pub fail_stop_attempts: u32,
    /// Advertise progress reporting so callers use `start_with_progress`.
    pub supports_progress: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            start_delay: Duration::ZERO,
            fail_start: false,
            script_output: vec![b"ok\n".to_vec()],
            chunk_interval: Duration::ZERO,
            exit_code: 0,
            hang_after_output: false,
            fail_stop_attempts: 0,
            supports_progress: false,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    starts: AtomicU32,
    stops: AtomicU32,
    stop_attempts: AtomicU32,
    progress_reports: AtomicU32,
    last_script: Mutex<Option<Vec<u8>>>,
}

pub struct MockProvider {
    behavior: Mutex<MockBehavior>,
    state: Arc<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(MockBehavior::default()),
            state: Arc::new(MockState::default()),
        }
    }

    /// Replace the scripted behavior for subsequent starts.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn starts(&self) -> u32 {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.state.stops.load(Ordering::SeqCst)
    }

    pub fn stop_attempts(&self) -> u32 {
        self.state.stop_attempts.load(Ordering::SeqCst)
    }

    /// Instances started but not yet successfully stopped.
    pub fn live(&self) -> u32 {
        self.starts() - self.stops()
    }

    /// Progress messages received through `start_with_progress`.
    pub fn progress_reports(&self) -> u32 {
        self.state.progress_reports.load(Ordering::SeqCst)
    }

    /// The script most recently uploaded to any instance.
    pub fn last_script(&self) -> Option<Vec<u8>> {
        self.state.last_script.lock().unwrap().clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn setup(&self, _token: &CancellationToken) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn start(
        &self,
        token: &CancellationToken,
        attrs: &StartAttributes,
    ) -> Result<Box<dyn Instance>, ProviderError> {
        let behavior = self.behavior.lock().unwrap().clone();
        let started = std::time::Instant::now();

        if behavior.start_delay > Duration::ZERO {
            tokio::select! {
                _ = token.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(behavior.start_delay) => {}
            }
        }

        if behavior.fail_start {
            return Err(ProviderError::ProvisionFailed(
                "mock provisioning failure".to_string(),
            ));
        }

        self.state.starts.fetch_add(1, Ordering::SeqCst);
        let fail_stop_attempts = behavior.fail_stop_attempts;

        Ok(Box::new(MockInstance {
            id: format!("mock-{}", attrs.job_id),
            image_name: attrs
                .image_name
                .clone()
                .unwrap_or_else(|| "mock-image".to_string()),
            behavior,
            state: Arc::clone(&self.state),
            startup_duration: started.elapsed(),
            stopped: AtomicBool::new(false),
            stop_failures_left: AtomicU32::new(fail_stop_attempts),
        }))
    }

    fn supports_progress(&self) -> bool {
        self.behavior.lock().unwrap().supports_progress
    }

    async fn start_with_progress(
        &self,
        token: &CancellationToken,
        attrs: &StartAttributes,
        progress: &dyn ProgressReporter,
    ) -> Result<Box<dyn Instance>, ProviderError> {
        progress.report("booting mock instance");
        self.state.progress_reports.fetch_add(1, Ordering::SeqCst);
        self.start(token, attrs).await
    }
}

pub struct MockInstance {
    id: String,
    image_name: String,
    behavior: MockBehavior,
    state: Arc<MockState>,
    startup_duration: Duration,
    stopped: AtomicBool,
    stop_failures_left: AtomicU32,
}

#[async_trait]
impl Instance for MockInstance {
    async fn upload_script(
        &self,
        token: &CancellationToken,
        script: &[u8],
    ) -> Result<(), ProviderError> {
        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        *self.state.last_script.lock().unwrap() = Some(script.to_vec());
        Ok(())
    }

    async fn run_script(
        &self,
        token: &CancellationToken,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<RunResult, ProviderError> {
        for chunk in &self.behavior.script_output {
            if self.behavior.chunk_interval > Duration::ZERO {
                tokio::select! {
                    _ = token.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(self.behavior.chunk_interval) => {}
                }
            }
            if token.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let _ = output.send(chunk.clone()).await;
        }

        if self.behavior.hang_after_output {
            token.cancelled().await;
            return Err(ProviderError::Cancelled);
        }

        Ok(RunResult {
            completed: true,
            exit_code: self.behavior.exit_code,
        })
    }

    async fn stop(&self, token: &CancellationToken) -> Result<(), ProviderError> {
        self.state.stop_attempts.fetch_add(1, Ordering::SeqCst);

        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let failures = self.stop_failures_left.load(Ordering::SeqCst);
        if failures > 0 {
            self.stop_failures_left.store(failures - 1, Ordering::SeqCst);
            return Err(ProviderError::StopFailed(
                "mock teardown failure".to_string(),
            ));
        }

        self.stopped.store(true, Ordering::SeqCst);
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn image_name(&self) -> String {
        self.image_name.clone()
    }

    fn startup_duration(&self) -> Duration {
        self.startup_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_run_stop_cycle() {
        let provider = MockProvider::new();
        let token = CancellationToken::new();
        let attrs = StartAttributes {
            job_id: 1,
            ..Default::default()
        };

        let instance = provider.start(&token, &attrs).await.unwrap();
        assert_eq!(provider.starts(), 1);
        assert_eq!(provider.live(), 1);

        instance
            .upload_script(&token, b"#!/bin/bash\ntrue\n")
            .await
            .unwrap();
        assert_eq!(
            provider.last_script().as_deref(),
            Some(b"#!/bin/bash\ntrue\n".as_slice())
        );

        let (tx, mut rx) = mpsc::channel(8);
        let result = instance.run_script(&token, tx).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(rx.recv().await.unwrap(), b"ok\n");

        instance.stop(&token).await.unwrap();
        assert_eq!(provider.live(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let provider = MockProvider::new();
        let token = CancellationToken::new();
        let attrs = StartAttributes::default();

        let instance = provider.start(&token, &attrs).await.unwrap();
        instance.stop(&token).await.unwrap();
        instance.stop(&token).await.unwrap();

        assert_eq!(provider.stops(), 1);
        assert_eq!(provider.stop_attempts(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_start() {
        let provider = MockProvider::new();
        provider.set_behavior(MockBehavior {
            start_delay: Duration::from_secs(60),
            ..Default::default()
        });
        let token = CancellationToken::new();
        token.cancel();

        let attrs = StartAttributes::default();
        let result = provider.start(&token, &attrs).await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert_eq!(provider.starts(), 0);
    }

    #[tokio::test]
    async fn test_stop_failures_then_success() {
        let provider = MockProvider::new();
        provider.set_behavior(MockBehavior {
            fail_stop_attempts: 2,
            ..Default::default()
        });
        let token = CancellationToken::new();
        let instance = provider.start(&token, &StartAttributes::default()).await.unwrap();

        assert!(instance.stop(&token).await.is_err());
        assert!(instance.stop(&token).await.is_err());
        assert!(instance.stop(&token).await.is_ok());
        assert_eq!(provider.stops(), 1);
    }
}
