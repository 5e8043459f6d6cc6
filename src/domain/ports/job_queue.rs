//! Job queue port - interface to the broker.

use async_trait::async_trait;

use crate::domain::errors::QueueError;

/// A single raw delivery: the payload bytes plus the handle the broker
/// needs for its terminal disposition.
pub struct Delivery {
    pub body: Vec<u8>,
    pub handle: Box<dyn DeliveryHandle>,
}

/// Broker-side handle for exactly one delivery.
///
/// `ack` and `nack` consume the handle, so each delivery sees at most one
/// disposition by construction.
#[async_trait]
pub trait DeliveryHandle: Send {
    /// The job reached a terminal result on this worker.
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    /// Reject the delivery, optionally returning it to the queue.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), QueueError>;
}

/// One processor's delivery channel.
///
/// Deliveries are FIFO within a stream; prefetch is pinned to one so a
/// slow processor never hoards work.
#[async_trait]
pub trait JobStream: Send + Sync {
    /// Wait for the next delivery. `Ok(None)` means the subscription was
    /// closed deliberately; a broker failure surfaces as `Err`.
    async fn next(&mut self) -> Result<Option<Delivery>, QueueError>;
}

/// Factory for per-processor delivery channels on a shared broker
/// connection.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Open a delivery channel with prefetch 1.
    async fn subscribe(&self) -> Result<Box<dyn JobStream>, QueueError>;

    /// Close the subscription so no new deliveries arrive. Idempotent.
    async fn close(&self) -> Result<(), QueueError>;
}
