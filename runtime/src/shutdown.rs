//! Graceful shutdown coordination.
//!
//! Components that hold broker resources register a [`ShutdownHandler`]. On
//! shutdown every handler runs in parallel under one overall deadline; if the
//! deadline passes the coordinator gives up and reports which components were
//! still running so the process can exit non-zero instead of hanging.
//!
//! ## Usage
//!
//! ```ignore
//! use hometrip_events_runtime::shutdown::*;
//! use std::time::Duration;
//!
//! let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
//! coordinator.register(Arc::new(bus.clone()));
//!
//! wait_for_signal().await;
//! coordinator.shutdown().await?;
//! ```

use crate::bus::{COMPONENT_NAME, EventBus};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Trait for components that need graceful shutdown
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    /// Component name for logging
    fn name(&self) -> &str;

    /// Gracefully shut down this component
    ///
    /// Should finish in-flight work and release resources.
    ///
    /// # Errors
    ///
    /// Returns a description of what could not be released.
    async fn shutdown(&self) -> Result<(), String>;
}

#[async_trait]
impl ShutdownHandler for EventBus {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.close().await;
        Ok(())
    }
}

/// Why a shutdown did not complete cleanly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    /// Every handler finished, some with errors
    #[error("{} component(s) failed to shut down: {}", .0.len(), .0.join("; "))]
    Failed(Vec<String>),

    /// The deadline passed before every handler finished
    #[error("shutdown timed out after {after:?}, still running: {}", pending.join(", "))]
    TimedOut {
        /// Deadline that was exceeded
        after: Duration,
        /// Components that had not finished
        pending: Vec<String>,
    },
}

/// Coordinates shutdown across multiple components
pub struct ShutdownCoordinator {
    handlers: Vec<Arc<dyn ShutdownHandler>>,
    shutdown_tx: broadcast::Sender<()>,
    timeout_duration: Duration,
}

impl ShutdownCoordinator {
    /// Create new shutdown coordinator
    ///
    /// `timeout` bounds the whole shutdown, not each handler.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            handlers: Vec::new(),
            shutdown_tx,
            timeout_duration: timeout,
        }
    }

    /// Register a shutdown handler
    ///
    /// Handlers are shut down in parallel, not in registration order.
    pub fn register(&mut self, handler: Arc<dyn ShutdownHandler>) {
        info!(component = handler.name(), "Registered shutdown handler");
        self.handlers.push(handler);
    }

    /// Get a receiver that fires when shutdown starts
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Configured deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout_duration
    }

    /// Shut every handler down.
    ///
    /// # Errors
    ///
    /// - [`ShutdownError::Failed`] if any handler returned an error.
    /// - [`ShutdownError::TimedOut`] if the deadline passed first.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        info!(
            components = self.handlers.len(),
            timeout = ?self.timeout_duration,
            "Initiating graceful shutdown"
        );

        if self.shutdown_tx.send(()).is_err() {
            warn!("No active shutdown signal receivers");
        }

        let pending: Arc<Mutex<BTreeSet<String>>> = Arc::new(Mutex::new(
            self.handlers.iter().map(|h| h.name().to_string()).collect(),
        ));

        let shutdown_futures: Vec<_> = self
            .handlers
            .iter()
            .map(|handler| {
                let pending = Arc::clone(&pending);
                async move {
                    let name = handler.name();
                    info!(component = name, "Shutting down component");
                    let result = handler.shutdown().await;
                    pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(name);

                    match result {
                        Ok(()) => {
                            info!(component = name, "Component shut down");
                            Ok(())
                        },
                        Err(e) => {
                            error!(component = name, error = %e, "Component shutdown failed");
                            Err(format!("{name}: {e}"))
                        },
                    }
                }
            })
            .collect();

        let all = futures::future::join_all(shutdown_futures);
        let Ok(results) = tokio::time::timeout(self.timeout_duration, all).await else {
            let pending: Vec<String> = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect();
            error!(
                timeout = ?self.timeout_duration,
                pending = ?pending,
                "Shutdown timed out"
            );
            return Err(ShutdownError::TimedOut {
                after: self.timeout_duration,
                pending,
            });
        };

        let errors: Vec<String> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            info!("All components shut down successfully");
            Ok(())
        } else {
            error!(failures = errors.len(), "Shutdown completed with errors");
            Err(ShutdownError::Failed(errors))
        }
    }

    /// Get number of registered handlers
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

type ShutdownFuture = std::pin::Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

type ShutdownFn = dyn Fn() -> ShutdownFuture + Send + Sync;

/// Generic shutdown handler using closures
///
/// # Example
///
/// ```ignore
/// let handler = GenericShutdownHandler::new("http-server", move || async move {
///     server.stop().await.map_err(|e| e.to_string())
/// });
/// ```
pub struct GenericShutdownHandler {
    name: String,
    on_shutdown: Arc<ShutdownFn>,
}

impl GenericShutdownHandler {
    /// Create new generic shutdown handler
    pub fn new<F, Fut>(name: impl Into<String>, on_shutdown: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            on_shutdown: Arc::new(move || Box::pin(on_shutdown())),
        }
    }
}

#[async_trait]
impl ShutdownHandler for GenericShutdownHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> Result<(), String> {
        (self.on_shutdown)().await
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
///
/// If the SIGTERM handler cannot be installed only Ctrl+C is watched.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            },
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            error!(error = %e, "Failed to wait for Ctrl+C, shutting down");
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use hometrip_events_testing::InMemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts its shutdowns and optionally fails or hangs.
    #[derive(Clone)]
    struct Component {
        name: &'static str,
        outcome: Result<(), &'static str>,
        hang: bool,
        stops: Arc<AtomicUsize>,
    }

    impl Component {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                outcome: Ok(()),
                hang: false,
                stops: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(name: &'static str, reason: &'static str) -> Self {
            Self {
                outcome: Err(reason),
                ..Self::ok(name)
            }
        }

        fn hanging(name: &'static str) -> Self {
            Self {
                hang: true,
                ..Self::ok(name)
            }
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ShutdownHandler for Component {
        fn name(&self) -> &str {
            self.name
        }

        async fn shutdown(&self) -> Result<(), String> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.outcome.map_err(str::to_string)
        }
    }

    #[tokio::test]
    async fn every_component_is_stopped_once() {
        let outbox = Component::ok("outbox-relay");
        let http = Component::ok("http-server");

        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(Arc::new(outbox.clone()));
        coordinator.register(Arc::new(http.clone()));

        assert_eq!(coordinator.shutdown().await, Ok(()));
        assert_eq!(outbox.stops(), 1);
        assert_eq!(http.stops(), 1);
    }

    #[tokio::test]
    async fn failures_are_collected_with_component_names() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(Arc::new(Component::ok("http-server")));
        coordinator.register(Arc::new(Component::failing("search-indexer", "flush rejected")));

        let result = coordinator.shutdown().await;

        assert_eq!(
            result,
            Err(ShutdownError::Failed(vec!["search-indexer: flush rejected".to_string()]))
        );
    }

    #[tokio::test]
    async fn subscribers_hear_that_shutdown_started() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut started = coordinator.subscribe();

        let listener = tokio::spawn(async move { started.recv().await.is_ok() });
        coordinator.shutdown().await.unwrap();

        assert!(listener.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_components_still_running() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        coordinator.register(Arc::new(Component::hanging("payment-poller")));
        coordinator.register(Arc::new(Component::ok("http-server")));

        let result = coordinator.shutdown().await;

        assert_eq!(
            result,
            Err(ShutdownError::TimedOut {
                after: Duration::from_millis(100),
                pending: vec!["payment-poller".to_string()],
            })
        );
        assert!(result.unwrap_err().to_string().contains("payment-poller"));
    }

    #[tokio::test]
    async fn event_bus_closes_through_the_coordinator() {
        let broker = InMemoryBroker::new();
        let config = BusConfig::new("review-service");
        let bus = EventBus::new(config, Arc::new(broker.clone())).unwrap();
        bus.connect().await.unwrap();

        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(Arc::new(bus.clone()));
        assert_eq!(coordinator.handler_count(), 1);

        coordinator.shutdown().await.unwrap();

        assert!(!bus.is_connected());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn closure_handlers_report_their_result() {
        let flushed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushed);
        let cache = GenericShutdownHandler::new("cache", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert_eq!(cache.name(), "cache");
        assert_eq!(cache.shutdown().await, Ok(()));
        assert_eq!(flushed.load(Ordering::SeqCst), 1);

        let broken = GenericShutdownHandler::new("mailer", || async {
            Err("smtp unreachable".to_string())
        });
        assert_eq!(broken.shutdown().await, Err("smtp unreachable".to_string()));
    }
}
