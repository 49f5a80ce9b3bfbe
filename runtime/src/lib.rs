//! # HomeTrip Events Runtime
//!
//! The event bus every HomeTrip service embeds: one connection manager,
//! publisher and subscriber per process, plus the lifecycle glue that connects
//! it at startup, reports readiness and shuts it down within a deadline.
//!
//! ## Core Components
//!
//! - **`EventBus`**: connection state machine, publish, subscribe, close
//! - **Reconnect policy**: exponential backoff with an attempt limit
//! - **`ServiceLifecycle`**: startup, readiness, signal handling and exit codes
//!
//! ## Example
//!
//! ```ignore
//! use hometrip_events_runtime::{BusConfig, EventBus, ServiceLifecycle, shutdown::wait_for_signal};
//! use hometrip_events_amqp::AmqpBroker;
//! use std::sync::Arc;
//!
//! let bus = EventBus::new(BusConfig::from_env()?, Arc::new(AmqpBroker::new()))?;
//! let lifecycle = ServiceLifecycle::new(bus.clone());
//! lifecycle.start().await?;
//!
//! bus.subscribe("booking.*", handle_booking).await?;
//!
//! let status = lifecycle.run_until(wait_for_signal()).await;
//! std::process::exit(status.code());
//! ```

/// Event bus: connection manager, publisher and subscriber
pub mod bus;

/// Bus configuration from values or the environment
pub mod config;

mod consumer;

/// Readiness reporting
pub mod health;

/// Service startup, run and shutdown
pub mod lifecycle;

/// Metrics for observability
pub mod metrics;

/// Reconnect policy with exponential backoff
pub mod retry;

/// Graceful shutdown coordination
pub mod shutdown;

pub use bus::{ConnectionState, EventBus, EventBusBuilder, SubscribeOptions};
pub use config::{BusConfig, ConfigError};
pub use consumer::SubscriptionId;
pub use health::{ComponentHealth, HealthStatus};
pub use lifecycle::{ExitStatus, LifecycleError, ServiceLifecycle};
pub use retry::{ReconnectPolicy, ReconnectState};
pub use shutdown::{ShutdownCoordinator, ShutdownError, ShutdownHandler};
