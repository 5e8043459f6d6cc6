//! Infrastructure layer: broker, backends, config, logging, telemetry.

pub mod amqp;
pub mod backends;
pub mod config;
pub mod logging;
pub mod retry;
pub mod script;
pub mod telemetry;
