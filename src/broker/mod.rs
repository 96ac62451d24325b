// ============================================================================
// Message Broker
// ============================================================================
//
// The connection manager is written against two seams:
//
//   BrokerDialer  - opens a connection + logical channel to one node URL
//   BrokerChannel - declare / publish / consume / close on that channel
//
// `amqp` implements them over RabbitMQ (lapin); `memory` is an in-process
// broker with the same priority and redelivery semantics, used by tests.
//
// ============================================================================

pub mod amqp;
pub mod connection;
pub mod memory;
pub mod publisher;
pub mod stats;

pub use connection::{BrokerConnectionManager, ChannelHandle, ConnectionState, FailureNotifier};
pub use publisher::PriorityPublisher;
pub use stats::{NodeStats, QueueStats, StatisticsCollector, Statistics};

use async_trait::async_trait;
use dispatch_error::ConnectionError;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::types::Priority;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Properties attached to every published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub priority: Priority,
    pub message_id: Option<String>,
    pub content_type: &'static str,
    /// Persistent delivery mode: the message survives a broker restart
    pub persistent: bool,
}

impl MessageProperties {
    pub fn persistent(priority: Priority) -> Self {
        Self {
            priority,
            message_id: None,
            content_type: CONTENT_TYPE_JSON,
            persistent: true,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), ConnectionError>;
    async fn nack(&self, requeue: bool) -> Result<(), ConnectionError>;
}

/// One message handed to a consumer. Must be acked or nacked exactly once.
pub struct Delivery {
    pub body: Vec<u8>,
    pub priority: Option<u8>,
    pub message_id: Option<String>,
    pub redelivered: bool,
    acker: Arc<dyn DeliveryAcker>,
    serial: Option<Arc<Mutex<()>>>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("priority", &self.priority)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        priority: Option<u8>,
        message_id: Option<String>,
        redelivered: bool,
        acker: Arc<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            body,
            priority,
            message_id,
            redelivered,
            acker,
            serial: None,
        }
    }

    /// Route ack/nack through the lock that guards the shared channel.
    pub(crate) fn serialized_by(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.serial = Some(lock);
        self
    }

    pub async fn ack(&self) -> Result<(), ConnectionError> {
        let _guard = match &self.serial {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), ConnectionError> {
        let _guard = match &self.serial {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        self.acker.nack(requeue).await
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, ConnectionError>>;

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Idempotently declare a durable queue with `x-max-priority`.
    async fn declare_priority_queue(&self, name: &str, max_priority: u8) -> Result<(), ConnectionError>;

    /// Publish through the default exchange, routed by queue name.
    async fn publish(&self, queue: &str, body: &[u8], properties: &MessageProperties) -> Result<(), ConnectionError>;

    /// Start a consumer. The stream ends or yields an error when the channel dies.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream, ConnectionError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), ConnectionError>;
}

#[async_trait]
pub trait BrokerDialer: Send + Sync {
    /// Connect to one node and open a channel. `on_failure` must be fired
    /// when the broker closes the connection underneath the channel.
    async fn dial(&self, url: &str, on_failure: FailureNotifier) -> Result<Arc<dyn BrokerChannel>, ConnectionError>;
}
