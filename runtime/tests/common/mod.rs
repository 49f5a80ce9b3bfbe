//! Shared fixtures for event bus integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use hometrip_events_core::{HandlerOutcome, MessageHandler, ReceivedMessage};
use hometrip_events_runtime::{BusConfig, EventBus, ReconnectPolicy};
use hometrip_events_testing::{InMemoryBroker, RecordingSleeper, test_clock};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const EXCHANGE: &str = "hometrip_events";
pub const SERVICE: &str = "booking-service";
pub const WAIT: Duration = Duration::from_secs(2);

/// A bus wired to an in-memory broker with deterministic time.
pub struct Harness {
    pub broker: InMemoryBroker,
    pub sleeper: RecordingSleeper,
    pub bus: EventBus,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(config(), RecordingSleeper::new())
    }

    pub fn with(config: BusConfig, sleeper: RecordingSleeper) -> Self {
        hometrip_events_testing::init_test_tracing();
        let broker = InMemoryBroker::new();
        let bus = Self::bus_on(&broker, config, &sleeper);
        Self {
            broker,
            sleeper,
            bus,
        }
    }

    /// Another bus on the same broker (a second service instance).
    pub fn bus_on(
        broker: &InMemoryBroker,
        config: BusConfig,
        sleeper: &RecordingSleeper,
    ) -> EventBus {
        EventBus::builder(config, Arc::new(broker.clone()))
            .clock(Arc::new(test_clock()))
            .sleeper(Arc::new(sleeper.clone()))
            .build()
            .unwrap()
    }

    pub async fn connected() -> Self {
        let harness = Self::new();
        harness.bus.connect().await.unwrap();
        harness
    }
}

/// Five attempts starting at 100 ms.
pub fn config() -> BusConfig {
    BusConfig::new(SERVICE).with_reconnect(
        ReconnectPolicy::builder()
            .max_attempts(5)
            .base_delay(Duration::from_millis(100))
            .build(),
    )
}

/// Handler that records every message it sees and acks.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<ReceivedMessage>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn routing_keys(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.routing_key).collect()
    }

    pub fn handler(&self) -> impl MessageHandler {
        let seen = Arc::clone(&self.seen);
        move |message: ReceivedMessage| {
            seen.lock().unwrap().push(message);
            async { HandlerOutcome::Ack }
        }
    }
}
