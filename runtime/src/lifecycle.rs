//! Service lifecycle: connect at startup, run until told to stop, shut down
//! within a deadline.
//!
//! ```ignore
//! let lifecycle = ServiceLifecycle::new(bus.clone());
//! if let Err(e) = lifecycle.start().await {
//!     tracing::error!(error = %e, "Startup failed");
//!     std::process::exit(ExitStatus::StartupFailed.code());
//! }
//! bus.subscribe("booking.*", on_booking).await?;
//!
//! let status = lifecycle.run_until(wait_for_signal()).await;
//! std::process::exit(status.code());
//! ```

use crate::bus::{ConnectionState, EventBus};
use crate::health::ComponentHealth;
use crate::shutdown::{ShutdownCoordinator, ShutdownError, ShutdownHandler};
use hometrip_events_core::EventBusError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Startup errors.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The first connect failed; the service must not start serving.
    #[error("Event bus unavailable at startup: {0}")]
    Startup(#[source] EventBusError),
}

/// How the service stopped, mapped to a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Signal received and every component shut down in time
    Clean,
    /// Could not connect at startup
    StartupFailed,
    /// Gave up reconnecting to the broker
    ReconnectExhausted,
    /// A component reported an error while shutting down
    ShutdownFailed,
    /// Shutdown did not finish within the deadline
    ShutdownTimedOut,
}

impl ExitStatus {
    /// Process exit code: zero only for a clean stop.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::StartupFailed
            | Self::ReconnectExhausted
            | Self::ShutdownFailed
            | Self::ShutdownTimedOut => 1,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Clean => "clean",
            Self::StartupFailed => "startup failed",
            Self::ReconnectExhausted => "reconnect exhausted",
            Self::ShutdownFailed => "shutdown failed",
            Self::ShutdownTimedOut => "shutdown timed out",
        };
        f.write_str(text)
    }
}

enum Trigger {
    Signal,
    Exhausted,
}

/// Drives one service's event bus from startup to exit.
pub struct ServiceLifecycle {
    bus: EventBus,
    coordinator: ShutdownCoordinator,
    exit_on_exhaustion: bool,
}

impl ServiceLifecycle {
    /// Lifecycle for `bus`, using its configured shutdown timeout.
    ///
    /// The bus is registered as the first shutdown handler.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        let config = bus.config();
        let mut coordinator = ShutdownCoordinator::new(config.shutdown_timeout);
        let exit_on_exhaustion = config.exit_on_exhaustion;
        coordinator.register(Arc::new(bus.clone()));

        Self {
            bus,
            coordinator,
            exit_on_exhaustion,
        }
    }

    /// Register another component to shut down alongside the bus.
    pub fn register(&mut self, handler: Arc<dyn ShutdownHandler>) {
        self.coordinator.register(handler);
    }

    /// The managed bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Connect the bus.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Startup`] if the connection cannot be made.
    /// The caller should exit with [`ExitStatus::StartupFailed`].
    pub async fn start(&self) -> Result<(), LifecycleError> {
        crate::metrics::register_metrics();
        tracing::info!(
            service = %self.bus.config().service_name,
            exchange = %self.bus.config().exchange,
            "Starting service"
        );
        self.bus.connect().await.map_err(LifecycleError::Startup)
    }

    /// Readiness for health checks.
    #[must_use]
    pub fn readiness(&self) -> ComponentHealth {
        self.bus.health()
    }

    /// Run until `signal` resolves (or the bus gives up reconnecting, when
    /// configured to exit on exhaustion), then shut down.
    pub async fn run_until<S>(&self, signal: S) -> ExitStatus
    where
        S: Future<Output = ()>,
    {
        let trigger = if self.exit_on_exhaustion {
            let exhausted = self
                .bus
                .wait_for_state(|state| state == ConnectionState::Exhausted);
            tokio::select! {
                () = signal => Trigger::Signal,
                _ = exhausted => Trigger::Exhausted,
            }
        } else {
            signal.await;
            Trigger::Signal
        };

        if matches!(trigger, Trigger::Exhausted) {
            tracing::error!("Event bus gave up reconnecting, shutting down");
        } else {
            tracing::info!(
                timeout = ?self.coordinator.timeout(),
                "Shutdown signal received"
            );
        }

        let shutdown = self.coordinator.shutdown().await;
        let status = match (trigger, shutdown) {
            (Trigger::Exhausted, _) => ExitStatus::ReconnectExhausted,
            (Trigger::Signal, Ok(())) => ExitStatus::Clean,
            (Trigger::Signal, Err(ShutdownError::Failed(_))) => ExitStatus::ShutdownFailed,
            (Trigger::Signal, Err(ShutdownError::TimedOut { .. })) => ExitStatus::ShutdownTimedOut,
        };

        tracing::info!(status = %status, code = status.code(), "Service stopped");
        status
    }
}
