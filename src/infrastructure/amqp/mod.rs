//! AMQP adapters: job queue, control-command consumer, log publisher.

pub mod commands;
pub mod job_queue;
pub mod log_writer;

pub use commands::CommandConsumer;
pub use job_queue::AmqpJobQueue;
pub use log_writer::AmqpLogSink;

use anyhow::{Context, Result};
use lapin::{Connection, ConnectionProperties};

/// Establish the shared broker connection.
pub async fn connect(uri: &str) -> Result<Connection> {
    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .context("couldn't connect to AMQP")?;
    tracing::debug!("connected to AMQP");
    Ok(connection)
}
