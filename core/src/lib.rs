//! # HomeTrip Events Core
//!
//! Core types and traits for the HomeTrip event bus.
//!
//! Every marketplace service (auth, listings, bookings, payments, notifications,
//! ...) talks to the others through one durable topic exchange. This crate holds
//! the broker-agnostic pieces of that integration layer:
//!
//! - [`envelope`]: the JSON message envelope carried on the wire
//! - [`topic`]: topic-exchange binding patterns (`*` and `#`)
//! - [`handler`]: the subscriber contract and its explicit outcomes
//! - [`broker`]: the seam a concrete broker client plugs into
//! - [`environment`]: injected clock and scheduler
//! - [`error`]: the event bus error taxonomy
//!
//! ## Architecture
//!
//! ```text
//! Publisher ──► Exchange ──► bound Queue(s) ──► Consumer ──► Handler
//!                 (topic)     (pattern match)                  │
//!                                 ▲                            ▼
//!                                 └──── requeue ◄──── Ack / Requeue / Discard
//! ```
//!
//! The stateful pieces (connection manager, publisher, consumer, lifecycle) live
//! in `hometrip-events-runtime`. Broker implementations live in
//! `hometrip-events-amqp` (production) and `hometrip-events-testing` (in-memory).

pub mod broker;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod handler;
pub mod topic;

// Re-export commonly used types
pub use broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerFuture, BrokerSession, Delivery,
    DeliveryStream, QueueSpec,
};
pub use envelope::Envelope;
pub use environment::{Clock, Sleeper, SystemClock, TokioSleeper};
pub use error::EventBusError;
pub use handler::{HandlerOutcome, MessageHandler, ReceivedMessage, typed};
pub use topic::TopicPattern;
