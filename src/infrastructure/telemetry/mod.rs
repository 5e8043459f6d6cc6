//! Metrics sink implementations.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::domain::ports::MetricsSink;

/// Thread-safe in-memory counter registry.
///
/// The daemon reports from it periodically; the test suite asserts
/// against it directly.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    timings: Mutex<HashMap<String, Vec<Duration>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter.
    pub fn count(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Recorded duration samples for a timing.
    pub fn timings(&self, name: &str) -> Vec<Duration> {
        self.timings
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every counter, for the periodic reporter.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters.lock().unwrap().clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn mark(&self, name: &str) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        self.timings
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(elapsed);
    }
}

/// Sink that emits every sample as a debug log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn mark(&self, name: &str) {
        debug!(target: "kiln::metrics", metric = name, "mark");
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        debug!(
            target: "kiln::metrics",
            metric = name,
            millis = elapsed.as_millis() as u64,
            "timing"
        );
    }
}
