//! AMQP-backed job queue.
//!
//! Each processor gets its own channel on the shared connection with
//! prefetch pinned to one, so the broker fair-dispatches across
//! processors and a slow one never hoards deliveries.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, Consumer};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::domain::errors::QueueError;
use crate::domain::ports::{Delivery, DeliveryHandle, JobQueue, JobStream};

pub struct AmqpJobQueue {
    connection: Arc<Connection>,
    queue_name: String,
    channels: Mutex<Vec<Channel>>,
}

impl AmqpJobQueue {
    pub fn new(connection: Arc<Connection>, queue_name: impl Into<String>) -> Self {
        Self {
            connection,
            queue_name: queue_name.into(),
            channels: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl JobQueue for AmqpJobQueue {
    async fn subscribe(&self) -> Result<Box<dyn JobStream>, QueueError> {
        let channel = self.connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let consumer_tag = format!("kiln-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &self.queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(queue = %self.queue_name, tag = %consumer_tag, "subscribed");
        self.channels.lock().unwrap().push(channel);

        Ok(Box::new(AmqpJobStream { consumer }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        let channels: Vec<Channel> = self.channels.lock().unwrap().drain(..).collect();
        for channel in channels {
            // A channel that is already gone is fine; we only need the
            // consumers stopped.
            let _ = channel.close(200, "worker shutdown").await;
        }
        Ok(())
    }
}

struct AmqpJobStream {
    consumer: Consumer,
}

#[async_trait]
impl JobStream for AmqpJobStream {
    async fn next(&mut self) -> Result<Option<Delivery>, QueueError> {
        match self.consumer.next().await {
            None => Ok(None),
            Some(Ok(delivery)) => {
                let acker = delivery.acker.clone();
                Ok(Some(Delivery {
                    body: delivery.data,
                    handle: Box::new(AmqpDeliveryHandle { acker }),
                }))
            }
            Some(Err(e)) => Err(e.into()),
        }
    }
}

struct AmqpDeliveryHandle {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl DeliveryHandle for AmqpDeliveryHandle {
    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Disposition(e.to_string()))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), QueueError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Disposition(e.to_string()))
    }
}
