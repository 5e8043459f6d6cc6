//! Port trait definitions.
//!
//! These async traits are the contracts the worker core consumes; the
//! infrastructure layer provides the AMQP, HTTP and cloud-backend
//! implementations, and the tests provide in-memory ones.

pub mod job_queue;
pub mod log_sink;
pub mod metrics;
pub mod provider;
pub mod script;

pub use job_queue::{Delivery, DeliveryHandle, JobQueue, JobStream};
pub use log_sink::LogSink;
pub use metrics::MetricsSink;
pub use provider::{Instance, ProgressReporter, Provider, RunResult, StartAttributes};
pub use script::BuildScriptGenerator;
