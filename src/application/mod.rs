//! Application layer: the processor pool and its job lifecycle.

pub mod dispatcher;
pub mod pool;
pub mod processor;

pub use dispatcher::{CancellationGuard, CommandDispatcher};
pub use pool::ProcessorPool;
pub use processor::{Processor, ProcessorState};
