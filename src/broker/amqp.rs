//! RabbitMQ implementation of the broker traits.

use super::{Broker, DeliveryStream, QueueMessage};
use crate::error::BrokerError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deliveries handed to one consumer before it acknowledges any of them.
const PREFETCH_COUNT: u16 = 1;

const DEAD_LETTER_SUFFIX: &str = "_dead";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Owns the single broker connection shared by all workers.
///
/// Workers open their own channels through [`ConnectionManager::channel`]. When
/// the connection drops, [`ConnectionManager::supervise`] replaces it; workers
/// asking for a channel in the meantime get [`BrokerError::NotConnected`].
pub struct ConnectionManager {
    uri: String,
    connection: RwLock<Option<Arc<Connection>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    reconnect_delay: Duration,
}

impl ConnectionManager {
    /// Connects once. Failure here is returned to the caller.
    pub async fn connect(
        uri: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Result<Arc<Self>, BrokerError> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let manager = Arc::new(Self {
            uri: uri.into(),
            connection: RwLock::new(None),
            state: Arc::new(state),
            reconnect_delay,
        });
        manager.establish().await?;
        Ok(manager)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Opens a fresh channel on the current connection.
    pub async fn channel(&self) -> Result<Channel, BrokerError> {
        if self.state() != ConnectionState::Connected {
            return Err(BrokerError::NotConnected);
        }
        let connection = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(BrokerError::NotConnected)?;
        connection
            .create_channel()
            .await
            .map_err(BrokerError::Channel)
    }

    /// Reconnects every time the connection is lost, until `cancel` fires.
    pub async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        let mut state = self.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = state.wait_for(|s| *s == ConnectionState::Disconnected) => {
                    if changed.is_err() {
                        return;
                    }
                }
            }

            error!("RabbitMQ connection closed unexpectedly, reconnecting");

            loop {
                match self.establish().await {
                    Ok(()) => {
                        info!("RabbitMQ reconnect succeeded");
                        break;
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            "RabbitMQ reconnect failed, retrying in {:?}",
                            self.reconnect_delay
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }
    }

    /// Closes the connection on shutdown.
    pub async fn close(&self) {
        let connection = self.connection.write().await.take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close(200, "worker shutdown").await {
                warn!(error = %e, "Failed to close RabbitMQ connection");
            }
        }
    }

    async fn establish(&self) -> Result<(), BrokerError> {
        self.state.send_replace(ConnectionState::Connecting);

        let connection = match Connection::connect(&self.uri, ConnectionProperties::default()).await
        {
            Ok(connection) => connection,
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(BrokerError::Connect(e));
            }
        };

        let state = Arc::clone(&self.state);
        connection.on_error(move |e| {
            warn!(error = %e, "RabbitMQ connection error");
            state.send_replace(ConnectionState::Disconnected);
        });

        *self.connection.write().await = Some(Arc::new(connection));
        self.state.send_replace(ConnectionState::Connected);
        info!("Connected to RabbitMQ");
        Ok(())
    }
}

/// Name of the queue receiving rejected and expired messages of `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// Work-queue arguments routing dead letters through the default exchange.
pub fn work_queue_arguments(queue: &str, message_ttl: Duration) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(LongString::from("")),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(LongString::from(dead_letter_queue(queue))),
    );
    arguments.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(message_ttl.as_millis() as i64),
    );
    arguments
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

/// Declares the dead-letter queue, then the work queue pointing at it.
pub async fn declare_queues(
    channel: &Channel,
    queue: &str,
    message_ttl: Duration,
) -> Result<(), BrokerError> {
    let dead = dead_letter_queue(queue);
    channel
        .queue_declare(&dead, durable(), FieldTable::default())
        .await
        .map_err(|source| BrokerError::Declare {
            queue: dead.clone(),
            source,
        })?;

    channel
        .queue_declare(queue, durable(), work_queue_arguments(queue, message_ttl))
        .await
        .map_err(|source| BrokerError::Declare {
            queue: queue.to_string(),
            source,
        })?;

    debug!(queue = %queue, dead_letter = %dead, "Declared queues");
    Ok(())
}

/// Broker backed by a [`ConnectionManager`].
#[derive(Clone)]
pub struct AmqpBroker {
    connection: Arc<ConnectionManager>,
    message_ttl: Duration,
}

impl AmqpBroker {
    pub fn new(connection: Arc<ConnectionManager>, message_ttl: Duration) -> Self {
        Self {
            connection,
            message_ttl,
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Consumer = AmqpConsumer;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<AmqpConsumer, BrokerError> {
        let channel = self.connection.channel().await?;
        declare_queues(&channel, queue, self.message_ttl).await?;

        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(BrokerError::Channel)?;

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| BrokerError::Consume {
                queue: queue.to_string(),
                source,
            })?;

        Ok(AmqpConsumer { channel, consumer })
    }
}

pub struct AmqpConsumer {
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpConsumer {
    type Delivery = AmqpDelivery;

    async fn next_delivery(&mut self) -> Option<Result<AmqpDelivery, BrokerError>> {
        self.consumer
            .next()
            .await
            .map(|delivery| delivery.map(AmqpDelivery).map_err(BrokerError::Channel))
    }

    async fn close(&mut self) {
        if !self.channel.status().connected() {
            return;
        }
        if let Err(e) = self.channel.close(200, "consumer closed").await {
            warn!(error = %e, "Failed to close channel");
        }
    }
}

pub struct AmqpDelivery(Delivery);

#[async_trait]
impl QueueMessage for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    fn routing_key(&self) -> &str {
        self.0.routing_key.as_str()
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(BrokerError::Settle)
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        self.0
            .acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(BrokerError::Settle)
    }
}
