//! Metrics sink port.

use std::time::Duration;

/// Fire-and-forget telemetry. Implementations are thread-safe and must
/// never block the state machine.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter by one.
    fn mark(&self, name: &str);

    /// Record a duration sample.
    fn timing(&self, name: &str, elapsed: Duration);
}

/// Sink that drops everything; useful as a default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn mark(&self, _name: &str) {}

    fn timing(&self, _name: &str, _elapsed: Duration) {}
}
