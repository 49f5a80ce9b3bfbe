//! Broker seam.
//!
//! The event bus never talks to a broker client directly. It drives these
//! traits, which the AMQP adapter implements over a real connection and the
//! testing crate implements in memory.
//!
//! # Shape
//!
//! ```text
//! Broker::connect(url) ──► BrokerSession
//!                           ├── connection: Box<dyn BrokerConnection>
//!                           ├── channel:    Arc<dyn BrokerChannel>   (publish / consume)
//!                           └── lost:       oneshot::Receiver<String> (abnormal close)
//! ```
//!
//! One session holds one connection and one logical channel. When the broker
//! drops the connection, `lost` resolves with the cause; the bus then discards
//! the whole session and reconnects.
//!
//! # Dyn Compatibility
//!
//! Like the rest of the crate, these traits return `Pin<Box<dyn Future>>` so
//! they can be held as trait objects (`Arc<dyn Broker>`).

use crate::error::EventBusError;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventBusError>> + Send + 'a>>;

/// Stream of deliveries from one consumer.
///
/// The stream ends when the consumer is cancelled or its channel closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Entry point of a broker implementation.
pub trait Broker: Send + Sync {
    /// Open a connection and a channel to the broker at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the broker is unreachable,
    /// rejects the credentials, or the channel cannot be opened.
    fn connect(&self, url: &str) -> BrokerFuture<'_, BrokerSession>;
}

/// A live connection with its channel.
pub struct BrokerSession {
    /// Transport-level link
    pub connection: Box<dyn BrokerConnection>,
    /// Logical channel used for every publish/consume operation
    pub channel: Arc<dyn BrokerChannel>,
    /// Resolves with the cause when the connection closes abnormally.
    ///
    /// A dropped sender (graceful close) is not a failure signal by itself.
    pub lost: oneshot::Receiver<String>,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession").finish_non_exhaustive()
    }
}

/// Transport-level connection.
pub trait BrokerConnection: Send + Sync {
    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Transport`] if the close handshake fails.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    /// Queue name; `None` lets the broker generate one
    pub name: Option<String>,
    /// Survives broker restarts
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it
    pub exclusive: bool,
    /// Deleted once its last consumer goes away
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A durable, shared queue with a fixed name.
    ///
    /// Several service instances consuming the same named queue share its
    /// messages (competing consumers).
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// An anonymous queue owned by this connection.
    ///
    /// Every instance gets its own copy of each matching message, and the queue
    /// disappears when the connection closes.
    #[must_use]
    pub const fn exclusive() -> Self {
        Self {
            name: None,
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Logical channel over a connection.
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable topic exchange. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Transport`] if the broker rejects the declaration.
    fn declare_exchange(&self, exchange: &str) -> BrokerFuture<'_, ()>;

    /// Declare a queue, returning its (possibly generated) name. Idempotent for named queues.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Transport`] if the broker rejects the declaration.
    fn declare_queue(&self, spec: &QueueSpec) -> BrokerFuture<'_, String>;

    /// Bind `queue` to `exchange` with a routing-key pattern.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Transport`] if the queue or exchange does not exist.
    fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BrokerFuture<'_, ()>;

    /// Bound the number of unacknowledged deliveries per consumer.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Transport`] if the channel is closed.
    fn set_prefetch(&self, count: u16) -> BrokerFuture<'_, ()>;

    /// Publish a JSON body with persistent delivery mode.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Transport`] if the broker does not accept the frame.
    fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> BrokerFuture<'_, ()>;

    /// Start consuming `queue` with manual acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Transport`] if the queue does not exist or the
    /// channel is closed.
    fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerFuture<'_, DeliveryStream>;

    /// Close the channel.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Transport`] if the close handshake fails.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// Settles a single delivery.
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledge; the broker forgets the message.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Transport`] if the channel is gone, in which
    /// case the broker will redeliver the message.
    fn ack(&self) -> BrokerFuture<'_, ()>;

    /// Negatively acknowledge, optionally returning the message to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Transport`] if the channel is gone.
    fn nack(&self, requeue: bool) -> BrokerFuture<'_, ()>;
}

/// A message delivered to a consumer.
pub struct Delivery {
    /// Routing key the message was published under
    pub routing_key: String,
    /// Raw body
    pub body: Vec<u8>,
    /// Set by the broker on redelivery
    pub redelivered: bool,
    /// Settles this delivery
    pub acker: Box<dyn Acknowledger>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
