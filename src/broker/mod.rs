//! Message broker abstraction consumed by the worker pool.
//!
//! The pool only needs to open a consumer on a queue, pull deliveries from it
//! and settle each one. [`amqp`] implements this over RabbitMQ.

pub mod amqp;

pub use amqp::{AmqpBroker, ConnectionManager, ConnectionState};

use crate::error::BrokerError;
use async_trait::async_trait;

/// Opens consumers on named queues.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Consumer: DeliveryStream;

    /// Declares `queue` (and its dead-letter queue) and starts consuming it.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<Self::Consumer, BrokerError>;
}

/// Deliveries from one consumer.
#[async_trait]
pub trait DeliveryStream: Send + 'static {
    type Delivery: QueueMessage;

    /// Next delivery. `None` means the consumer was closed by the broker.
    async fn next_delivery(&mut self) -> Option<Result<Self::Delivery, BrokerError>>;

    /// Closes the underlying channel. Errors are logged, not returned.
    async fn close(&mut self);
}

/// A received message awaiting settlement.
#[async_trait]
pub trait QueueMessage: Send + Sync + 'static {
    fn body(&self) -> &[u8];

    fn routing_key(&self) -> &str;

    async fn ack(&self) -> Result<(), BrokerError>;

    /// Rejects without requeue, leaving the message to the dead-letter policy.
    async fn reject(&self) -> Result<(), BrokerError>;
}
