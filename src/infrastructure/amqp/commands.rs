//! Control-plane command consumer.
//!
//! One subscription per worker process: a fanout exchange delivers every
//! control command (cancellations, mostly) to an exclusive, auto-deleted
//! queue, and the decoded commands are fed to the dispatcher.

use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ExchangeKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::errors::QueueError;
use crate::domain::models::command::ControlCommand;

const COMMANDS_EXCHANGE: &str = "worker.commands";

pub struct CommandConsumer {
    connection: Arc<Connection>,
}

impl CommandConsumer {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    /// Subscribe to the control exchange and forward decoded commands
    /// until the subscription or the receiver goes away.
    pub async fn run(self, commands: mpsc::Sender<ControlCommand>) -> Result<(), QueueError> {
        let channel = self.connection.create_channel().await?;

        channel
            .exchange_declare(
                COMMANDS_EXCHANGE,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_bind(
                queue.name().as_str(),
                COMMANDS_EXCHANGE,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "kiln-commands",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!(exchange = COMMANDS_EXCHANGE, queue = %queue.name(), "command consumer running");

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => return Err(e.into()),
            };

            match ControlCommand::from_bytes(&delivery.data) {
                Ok(command) => {
                    if commands.send(command).await.is_err() {
                        // Dispatcher is gone; the worker is shutting down.
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "dropping undecodable control command");
                }
            }
        }

        debug!("command consumer stopped");
        Ok(())
    }
}
