//! Fixed-interval bounded retry, shared by backends and teardown.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::errors::ProviderError;

/// Outcome of a retry loop that ran out of road.
#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display + std::fmt::Debug> {
    #[error("operation cancelled")]
    Cancelled,

    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl From<RetryError<ProviderError>> for ProviderError {
    fn from(err: RetryError<ProviderError>) -> Self {
        match err {
            RetryError::Cancelled => ProviderError::Cancelled,
            RetryError::Exhausted { attempts, last } => ProviderError::RetryExhausted {
                attempts,
                last_error: last.to_string(),
            },
        }
    }
}

/// Bounded retry loop with a fixed interval between attempts.
///
/// Cancellation is observed between attempts; a fired token wins over the
/// next tick.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    retries: u32,
    interval: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, interval: Duration) -> Self {
        assert!(retries > 0, "retries must be greater than 0");
        Self { retries, interval }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `op` until it succeeds, the budget is exhausted, or `token`
    /// fires. The attempt counter passed to `op` starts at 1 and strictly
    /// increases.
    pub async fn run<T, E, F, Fut>(
        &self,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display + std::fmt::Debug,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last = None;

        for attempt in 1..=self.retries {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    debug!(attempt, retries = self.retries, error = %e, "attempt failed");
                    last = Some(e);
                }
            }

            if attempt < self.retries {
                tokio::select! {
                    _ = token.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }

        Err(RetryError::Exhausted {
            attempts: self.retries,
            last: last.expect("at least one attempt ran"),
        })
    }
}
