pub mod logger;
pub mod sink;

pub use logger::init;
pub use sink::TracingLogSink;
