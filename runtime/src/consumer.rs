//! Delivery processing for subscriptions.
//!
//! Each subscription runs one consumer loop per session. The loop takes a
//! handler slot from a semaphore sized to the prefetch count before it spawns
//! the per-delivery task, so no more handlers run at once than the broker has
//! messages in flight.

use crate::metrics::{self, counter};
use hometrip_events_core::{
    Acknowledger, Delivery, DeliveryStream, Envelope, HandlerOutcome, MessageHandler, QueueSpec,
    ReceivedMessage, TopicPattern,
};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Identifier returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A registered subscription, restored after every reconnect.
pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub queue: QueueSpec,
    pub patterns: Vec<TopicPattern>,
    pub handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    pub fn pattern_list(&self) -> String {
        self.patterns
            .iter()
            .map(TopicPattern::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Pull deliveries until the stream ends.
pub(crate) async fn run(
    subscription: Arc<Subscription>,
    queue: String,
    mut deliveries: DeliveryStream,
    slots: Arc<Semaphore>,
) {
    while let Some(next) = deliveries.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::warn!(
                    subscription = %subscription.id,
                    queue = %queue,
                    error = %e,
                    "Consumer stream error"
                );
                continue;
            },
        };

        let Ok(slot) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let handler = Arc::clone(&subscription.handler);
        let queue = queue.clone();
        tokio::spawn(async move {
            process(handler, delivery, &queue).await;
            drop(slot);
        });
    }

    tracing::debug!(
        subscription = %subscription.id,
        queue = %queue,
        "Consumer stream ended"
    );
}

/// Decode, dispatch and settle one delivery.
///
/// Malformed bodies are discarded without reaching the handler. A handler that
/// panics counts as a failure and its message is requeued.
pub(crate) async fn process(
    handler: Arc<dyn MessageHandler>,
    delivery: Delivery,
    queue: &str,
) -> HandlerOutcome {
    let Delivery {
        routing_key,
        body,
        redelivered,
        acker,
    } = delivery;

    let outcome = match Envelope::from_bytes(&body) {
        Err(e) => {
            tracing::warn!(
                routing_key = %routing_key,
                queue,
                error = %e,
                "Discarding malformed message"
            );
            HandlerOutcome::Discard
        },
        Ok(envelope) => {
            let event_type = envelope.event_type.clone();
            let message = ReceivedMessage {
                routing_key: routing_key.clone(),
                redelivered,
                envelope,
            };

            let outcome = match tokio::spawn(async move { handler.handle(message).await }).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        routing_key = %routing_key,
                        event_type = %event_type,
                        error = %e,
                        "Handler panicked"
                    );
                    HandlerOutcome::Requeue
                },
            };

            match outcome {
                HandlerOutcome::Ack => tracing::debug!(
                    routing_key = %routing_key,
                    event_type = %event_type,
                    "Message handled"
                ),
                HandlerOutcome::Requeue => tracing::warn!(
                    routing_key = %routing_key,
                    event_type = %event_type,
                    redelivered,
                    "Handler failed, requeueing message"
                ),
                HandlerOutcome::Discard => tracing::warn!(
                    routing_key = %routing_key,
                    event_type = %event_type,
                    "Handler rejected message, discarding"
                ),
            }
            outcome
        },
    };

    settle(acker.as_ref(), outcome, &routing_key).await;
    outcome
}

async fn settle(acker: &dyn Acknowledger, outcome: HandlerOutcome, routing_key: &str) {
    let result = match outcome {
        HandlerOutcome::Ack => {
            counter!(metrics::ACKED_TOTAL).increment(1);
            acker.ack().await
        },
        HandlerOutcome::Requeue => {
            counter!(metrics::REQUEUED_TOTAL).increment(1);
            acker.nack(true).await
        },
        HandlerOutcome::Discard => {
            counter!(metrics::DISCARDED_TOTAL).increment(1);
            acker.nack(false).await
        },
    };

    // The broker redelivers anything left unsettled when the channel goes away.
    if let Err(e) = result {
        tracing::warn!(routing_key, outcome = %outcome, error = %e, "Failed to settle delivery");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use hometrip_events_core::{BrokerFuture, EventBusError};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingAcker {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Acknowledger for RecordingAcker {
        fn ack(&self) -> BrokerFuture<'_, ()> {
            self.calls.lock().unwrap().push("ack");
            Box::pin(async { Ok(()) })
        }

        fn nack(&self, requeue: bool) -> BrokerFuture<'_, ()> {
            self.calls
                .lock()
                .unwrap()
                .push(if requeue { "requeue" } else { "discard" });
            Box::pin(async { Ok(()) })
        }
    }

    fn delivery(body: &[u8], acker: &RecordingAcker) -> Delivery {
        Delivery {
            routing_key: "booking.completed".to_string(),
            body: body.to_vec(),
            redelivered: false,
            acker: Box::new(acker.clone()),
        }
    }

    const BOOKING: &[u8] = br#"{"type":"booking.completed","data":{"bookingId":"abc123"}}"#;

    #[tokio::test]
    async fn test_ack_on_success() {
        let acker = RecordingAcker::default();
        let handler: Arc<dyn MessageHandler> = Arc::new(|message: ReceivedMessage| async move {
            assert_eq!(message.envelope.data["bookingId"], "abc123");
            HandlerOutcome::Ack
        });

        let outcome = process(handler, delivery(BOOKING, &acker), "q").await;

        assert_eq!(outcome, HandlerOutcome::Ack);
        assert_eq!(*acker.calls.lock().unwrap(), ["ack"]);
    }

    #[tokio::test]
    async fn test_requeue_on_failure() {
        let acker = RecordingAcker::default();
        let handler: Arc<dyn MessageHandler> =
            Arc::new(|_message: ReceivedMessage| async { HandlerOutcome::Requeue });

        process(handler, delivery(BOOKING, &acker), "q").await;

        assert_eq!(*acker.calls.lock().unwrap(), ["requeue"]);
    }

    #[tokio::test]
    async fn test_malformed_body_discarded_without_handler() {
        let acker = RecordingAcker::default();
        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);
        let handler: Arc<dyn MessageHandler> = Arc::new(move |_message: ReceivedMessage| {
            *flag.lock().unwrap() = true;
            async { HandlerOutcome::Ack }
        });

        let outcome = process(handler, delivery(b"not json{", &acker), "q").await;

        assert_eq!(outcome, HandlerOutcome::Discard);
        assert!(!*called.lock().unwrap());
        assert_eq!(*acker.calls.lock().unwrap(), ["discard"]);
    }

    #[tokio::test]
    async fn test_panicking_handler_requeues() {
        let acker = RecordingAcker::default();
        async fn explode(_message: ReceivedMessage) -> HandlerOutcome {
            panic!("handler blew up");
        }
        let handler: Arc<dyn MessageHandler> = Arc::new(explode);

        let outcome = process(handler, delivery(BOOKING, &acker), "q").await;

        assert_eq!(outcome, HandlerOutcome::Requeue);
        assert_eq!(*acker.calls.lock().unwrap(), ["requeue"]);
    }

    #[tokio::test]
    async fn test_settle_error_is_swallowed() {
        struct FailingAcker;
        impl Acknowledger for FailingAcker {
            fn ack(&self) -> BrokerFuture<'_, ()> {
                Box::pin(async { Err(EventBusError::Transport("channel closed".into())) })
            }
            fn nack(&self, _requeue: bool) -> BrokerFuture<'_, ()> {
                Box::pin(async { Err(EventBusError::Transport("channel closed".into())) })
            }
        }

        let handler: Arc<dyn MessageHandler> =
            Arc::new(|_message: ReceivedMessage| async { HandlerOutcome::Ack });
        let delivery = Delivery {
            routing_key: "booking.completed".to_string(),
            body: BOOKING.to_vec(),
            redelivered: true,
            acker: Box::new(FailingAcker),
        };

        assert_eq!(process(handler, delivery, "q").await, HandlerOutcome::Ack);
    }

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId::new(7).to_string(), "sub-7");
        assert_eq!(SubscriptionId::new(7).get(), 7);
    }
}
