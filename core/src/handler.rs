//! Subscriber contract.
//!
//! A handler receives one decoded message and returns what should happen to it:
//!
//! | Outcome                     | Broker action          | Redelivered? |
//! |-----------------------------|------------------------|--------------|
//! | [`HandlerOutcome::Ack`]     | ack                    | never        |
//! | [`HandlerOutcome::Requeue`] | nack, requeue = true   | yes          |
//! | [`HandlerOutcome::Discard`] | nack, requeue = false  | never        |
//!
//! Delivery is at-least-once: a requeued message may come back to this or any
//! other consumer of the queue, so handlers must tolerate duplicates.
//!
//! # Example
//!
//! ```
//! use hometrip_events_core::handler::{HandlerOutcome, ReceivedMessage};
//!
//! async fn on_booking_completed(message: ReceivedMessage) -> HandlerOutcome {
//!     match message.envelope.data.get("bookingId") {
//!         Some(_) => HandlerOutcome::Ack,
//!         None => HandlerOutcome::Discard,
//!     }
//! }
//! ```

use crate::envelope::Envelope;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// What to do with a delivered message once the handler is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerOutcome {
    /// Processed; remove from the queue
    Ack,
    /// Transient failure; make the message available again
    Requeue,
    /// Permanent failure; drop the message
    Discard,
}

impl HandlerOutcome {
    /// Whether the broker should requeue the message.
    #[must_use]
    pub const fn requeues(self) -> bool {
        matches!(self, Self::Requeue)
    }
}

impl fmt::Display for HandlerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => f.write_str("ack"),
            Self::Requeue => f.write_str("requeue"),
            Self::Discard => f.write_str("discard"),
        }
    }
}

/// `Ok` acknowledges, `Err` requeues.
impl<E> From<Result<(), E>> for HandlerOutcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Ack,
            Err(_) => Self::Requeue,
        }
    }
}

/// A decoded message handed to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Routing key the message was published under
    pub routing_key: String,
    /// Set by the broker when this is not the first delivery
    pub redelivered: bool,
    /// Decoded envelope
    pub envelope: Envelope,
}

/// Boxed future returned by [`MessageHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerOutcome> + Send + 'a>>;

/// Trait for subscription handlers.
///
/// Any `Fn(ReceivedMessage) -> impl Future<Output = HandlerOutcome>` closure is a
/// handler. The trait returns boxed futures so subscriptions can be stored as
/// `Arc<dyn MessageHandler>` in the bus registry.
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one message.
    fn handle(&self, message: ReceivedMessage) -> HandlerFuture<'_>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn handle(&self, message: ReceivedMessage) -> HandlerFuture<'_> {
        Box::pin(self(message))
    }
}

/// Handler adapter that decodes `envelope.data` into `T` first.
///
/// Built with [`typed`].
pub struct TypedHandler<T, F> {
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

/// Wrap a handler that wants a concrete payload type.
///
/// If the payload does not decode into `T` the message is discarded: a
/// redelivery would fail the same way.
///
/// # Example
///
/// ```
/// use hometrip_events_core::handler::{HandlerOutcome, ReceivedMessage, typed};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// struct UserDeleted {
///     user_id: String,
/// }
///
/// let handler = typed(|payload: UserDeleted, _message: ReceivedMessage| async move {
///     println!("purging wishlists of {}", payload.user_id);
///     HandlerOutcome::Ack
/// });
/// # let _ = handler;
/// ```
pub fn typed<T, F, Fut>(handler: F) -> TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    TypedHandler {
        handler,
        _payload: PhantomData,
    }
}

impl<T, F, Fut> MessageHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn handle(&self, message: ReceivedMessage) -> HandlerFuture<'_> {
        match message.envelope.data_as::<T>() {
            Ok(payload) => Box::pin((self.handler)(payload, message)),
            Err(e) => {
                tracing::warn!(
                    routing_key = %message.routing_key,
                    event_type = %message.envelope.event_type,
                    error = %e,
                    "Discarding message with unexpected payload shape"
                );
                Box::pin(async { HandlerOutcome::Discard })
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    fn message(data: serde_json::Value) -> ReceivedMessage {
        ReceivedMessage {
            routing_key: "booking.completed".to_string(),
            redelivered: false,
            envelope: Envelope::new("booking.completed", data),
        }
    }

    #[test]
    fn outcome_from_result() {
        assert_eq!(HandlerOutcome::from(Ok::<(), String>(())), HandlerOutcome::Ack);
        assert_eq!(
            HandlerOutcome::from(Err::<(), _>("db unavailable")),
            HandlerOutcome::Requeue
        );
        assert!(HandlerOutcome::Requeue.requeues());
        assert!(!HandlerOutcome::Discard.requeues());
        assert_eq!(HandlerOutcome::Discard.to_string(), "discard");
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler: Arc<dyn MessageHandler> = Arc::new(|msg: ReceivedMessage| async move {
            if msg.envelope.data["bookingId"] == "abc123" {
                HandlerOutcome::Ack
            } else {
                HandlerOutcome::Requeue
            }
        });

        assert_eq!(
            handler.handle(message(json!({ "bookingId": "abc123" }))).await,
            HandlerOutcome::Ack
        );
        assert_eq!(
            handler.handle(message(json!({ "bookingId": "zzz" }))).await,
            HandlerOutcome::Requeue
        );
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct BookingCompleted {
        booking_id: String,
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let handler = typed(|payload: BookingCompleted, _msg: ReceivedMessage| async move {
            if payload.booking_id == "abc123" {
                HandlerOutcome::Ack
            } else {
                HandlerOutcome::Requeue
            }
        });

        assert_eq!(
            handler.handle(message(json!({ "bookingId": "abc123" }))).await,
            HandlerOutcome::Ack
        );
    }

    #[tokio::test]
    async fn typed_handler_discards_wrong_shape() {
        let handler = typed(|_payload: BookingCompleted, _msg: ReceivedMessage| async move {
            HandlerOutcome::Ack
        });

        assert_eq!(
            handler.handle(message(json!({ "listingId": 9 }))).await,
            HandlerOutcome::Discard
        );
    }
}
