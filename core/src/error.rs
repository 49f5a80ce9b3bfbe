//! Error taxonomy for event bus operations.
//!
//! Errors are split by how the caller is expected to react:
//!
//! - **Connection-level** ([`EventBusError::ConnectionFailed`], [`EventBusError::Transport`]):
//!   recoverable, handled by the reconnect policy.
//! - **Publish failures** ([`EventBusError::NotConnected`], [`EventBusError::PublishFailed`]):
//!   recoverable, the caller decides whether the missing fan-out matters.
//! - **Setup errors** ([`EventBusError::SubscriptionFailed`], [`EventBusError::InvalidPattern`]):
//!   bugs in the calling service, surfaced explicitly.
//! - **Fatal** ([`EventBusError::ReconnectExhausted`]): the hosting process should exit.

use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// No live broker connection
    #[error("Event bus is not connected")]
    NotConnected,

    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message under a routing key
    #[error("Publish failed for routing key '{routing_key}': {reason}")]
    PublishFailed {
        /// The routing key that failed
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to declare, bind or consume a subscription queue
    #[error("Subscription failed for pattern '{pattern}': {reason}")]
    SubscriptionFailed {
        /// The binding pattern that failed
        pattern: String,
        /// The reason for failure
        reason: String,
    },

    /// Binding pattern rejected at registration time
    #[error("Invalid binding pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected pattern
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// Routing key rejected before publishing
    #[error("Invalid routing key '{routing_key}': {reason}")]
    InvalidRoutingKey {
        /// The rejected routing key
        routing_key: String,
        /// Why it was rejected
        reason: String,
    },

    /// Failed to serialize an outgoing message
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Delivered body could not be decoded into an envelope
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Network or channel error reported by the broker client
    #[error("Transport error: {0}")]
    Transport(String),

    /// The reconnect policy gave up
    #[error("Max reconnection attempts reached ({attempts})")]
    ReconnectExhausted {
        /// Number of reconnect attempts made
        attempts: u32,
    },

    /// The bus was closed by its owner
    #[error("Event bus is closed")]
    Closed,
}

impl EventBusError {
    /// Whether this error means the connection itself is unusable.
    ///
    /// Connection-level errors are routed to the reconnect policy instead of
    /// being reported to callers as failures of their own operation.
    #[must_use]
    pub const fn is_connection_level(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Transport(_))
    }
}
