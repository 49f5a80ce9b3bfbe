//! # HomeTrip Events Testing
//!
//! Test doubles for the event bus.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a topic broker that routes, acknowledges and fails on demand
//! - [`RecordingSleeper`] and [`FixedClock`]: deterministic time
//! - Helpers for waiting on asynchronous effects
//! - proptest strategies for routing keys and patterns
//!
//! ## Example
//!
//! ```ignore
//! use hometrip_events_testing::{InMemoryBroker, RecordingSleeper, test_clock};
//! use hometrip_events_runtime::{BusConfig, EventBus};
//! use std::sync::Arc;
//!
//! #[tokio::test]
//! async fn test_booking_fan_out() {
//!     let broker = InMemoryBroker::new();
//!     let bus = EventBus::builder(BusConfig::new("booking-service"), Arc::new(broker.clone()))
//!         .clock(Arc::new(test_clock()))
//!         .sleeper(Arc::new(RecordingSleeper::new()))
//!         .build()
//!         .unwrap();
//!
//!     bus.connect().await.unwrap();
//!     bus.emit("booking.completed", "booking.completed", &json!({ "bookingId": "abc123" }))
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(broker.published_count(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use hometrip_events_core::environment::{Clock, Sleeper};

/// In-memory topic broker
pub mod broker;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Sleeper, Utc};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use hometrip_events_testing::mocks::FixedClock;
    /// use hometrip_events_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Sleeper that records every requested delay.
    ///
    /// By default each sleep completes on the next scheduler turn, so backoff
    /// schedules run instantly while their delays stay observable. A
    /// [`stalled`](Self::stalled) sleeper never wakes, which parks a reconnect
    /// loop between attempts.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingSleeper {
        delays: Arc<Mutex<Vec<Duration>>>,
        stalled: bool,
    }

    impl RecordingSleeper {
        /// Sleeper that returns immediately.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Sleeper that never returns.
        #[must_use]
        pub fn stalled() -> Self {
            Self {
                stalled: true,
                ..Self::default()
            }
        }

        /// Delays requested so far, in order.
        #[must_use]
        pub fn delays(&self) -> Vec<Duration> {
            self.delays
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Number of sleeps requested.
        #[must_use]
        pub fn count(&self) -> usize {
            self.delays
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            self.delays
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(duration);
            if self.stalled {
                Box::pin(std::future::pending())
            } else {
                Box::pin(tokio::task::yield_now())
            }
        }
    }
}

/// Test helpers and utilities
pub mod helpers {
    use std::time::Duration;

    /// Poll `condition` until it holds or `timeout` passes.
    ///
    /// Returns whether the condition was met.
    pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Install a test-friendly tracing subscriber (idempotent).
    ///
    /// Honors `RUST_LOG`; defaults to `warn`.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// A routing-key word.
    ///
    /// Mostly drawn from a small vocabulary so generated keys and patterns
    /// overlap often enough to exercise matches.
    pub fn word() -> impl Strategy<Value = String> {
        prop_oneof![
            3 => prop::sample::select(vec!["booking", "user", "created", "deleted"])
                .prop_map(str::to_string),
            1 => "[a-z]{1,8}",
        ]
    }

    /// A routing key of 1 to 4 words.
    pub fn routing_key() -> impl Strategy<Value = String> {
        prop::collection::vec(word(), 1..=4).prop_map(|words| words.join("."))
    }

    /// A binding pattern of 1 to 4 segments, each a word, `*` or `#`.
    pub fn pattern() -> impl Strategy<Value = String> {
        let segment = prop_oneof![
            3 => word(),
            1 => Just("*".to_string()),
            1 => Just("#".to_string()),
        ];
        prop::collection::vec(segment, 1..=4).prop_map(|segments| segments.join("."))
    }
}

// Re-export commonly used items
pub use broker::{BrokerMessage, InMemoryBroker};
pub use helpers::{eventually, init_test_tracing};
pub use mocks::{FixedClock, RecordingSleeper, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[tokio::test]
    async fn test_recording_sleeper_records_and_returns() {
        let sleeper = RecordingSleeper::new();
        sleeper.sleep(Duration::from_secs(1)).await;
        sleeper.sleep(Duration::from_secs(2)).await;
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sleeper_never_wakes() {
        let sleeper = RecordingSleeper::stalled();
        let woke =
            tokio::time::timeout(Duration::from_secs(60), sleeper.sleep(Duration::ZERO)).await;
        assert!(woke.is_err());
        assert_eq!(sleeper.count(), 1);
    }

    #[tokio::test]
    async fn test_eventually() {
        let mut calls = 0;
        assert!(
            eventually(Duration::from_secs(1), || {
                calls += 1;
                calls >= 3
            })
            .await
        );
        assert!(!eventually(Duration::from_millis(20), || false).await);
    }
}
