//! The event bus: connection manager, publisher and subscriber registry.
//!
//! # Connection state machine
//!
//! ```text
//!                 connect()                  broker handshake ok
//! Disconnected ─────────────► Connecting ─────────────────────────► Connected
//!      ▲                          │                                     │
//!      │      attempt failed      │         connection lost             │
//!      └──────────────────────────┘◄────────────────────────────────────┘
//!      │
//!      │ max_attempts used up
//!      ▼
//!  Exhausted  (terminal: no further automatic attempts)
//! ```
//!
//! Every transition back to `Disconnected` sends one signal to a supervisor
//! task. The supervisor handles signals one at a time and runs the reconnect
//! loop itself, so there is never more than one loop per bus. Signals carry the
//! generation of the session they refer to; a signal about a session that has
//! already been replaced is ignored.
//!
//! # Example
//!
//! ```rust,ignore
//! use hometrip_events_runtime::{EventBus, config::BusConfig};
//! use hometrip_events_core::{Envelope, HandlerOutcome, ReceivedMessage};
//! use hometrip_events_amqp::AmqpBroker;
//! use std::sync::Arc;
//!
//! let bus = EventBus::new(BusConfig::from_env()?, Arc::new(AmqpBroker::new()))?;
//! bus.connect().await?;
//!
//! bus.subscribe("booking.*", |message: ReceivedMessage| async move {
//!     println!("{}", message.envelope.event_type);
//!     HandlerOutcome::Ack
//! })
//! .await?;
//!
//! let booking = serde_json::json!({ "bookingId": "abc123" });
//! bus.emit("booking.completed", "booking.completed", &booking)
//!     .await
//!     .ok(); // fan-out failure is not fatal for the booking itself
//!
//! bus.close().await;
//! ```

use crate::config::{BusConfig, ConfigError};
use crate::consumer::{self, Subscription, SubscriptionId};
use crate::health::ComponentHealth;
use crate::metrics::{self, counter, gauge};
use crate::retry::ReconnectState;
use hometrip_events_core::topic::validate_routing_key;
use hometrip_events_core::{
    Broker, BrokerChannel, BrokerConnection, BrokerSession, Clock, Envelope, EventBusError,
    MessageHandler, QueueSpec, Sleeper, SystemClock, TokioSleeper, TopicPattern,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Name used for this component in health reports and shutdown logs.
pub const COMPONENT_NAME: &str = "event-bus";

/// Connection state of an [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection, none being attempted right now
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Connection, channel and exchange ready
    Connected,
    /// Reconnect attempts used up
    Exhausted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Exhausted => f.write_str("exhausted"),
        }
    }
}

/// Queue and bindings for [`EventBus::subscribe_with`].
///
/// # Example
///
/// ```
/// use hometrip_events_runtime::SubscribeOptions;
/// use hometrip_events_core::QueueSpec;
///
/// let options = SubscribeOptions::new(QueueSpec::named("wishlist-service.users"))
///     .bind("user.deleted")
///     .bind("listing.*");
/// assert_eq!(options.patterns().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    queue: QueueSpec,
    patterns: Vec<String>,
}

impl SubscribeOptions {
    /// Subscribe through `queue`.
    #[must_use]
    pub const fn new(queue: QueueSpec) -> Self {
        Self {
            queue,
            patterns: Vec::new(),
        }
    }

    /// Add a binding pattern.
    #[must_use]
    pub fn bind(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// Binding patterns added so far.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

enum Signal {
    /// A session stopped working.
    Lost { generation: u64, cause: String },
    /// An explicit `connect()` failed.
    ConnectFailed,
}

struct ActiveSession {
    channel: Arc<dyn BrokerChannel>,
    connection: Box<dyn BrokerConnection>,
    generation: u64,
    watcher: JoinHandle<()>,
}

struct Inner {
    config: BusConfig,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    state: watch::Sender<ConnectionState>,
    closing: watch::Sender<bool>,
    /// Serializes handshakes with subscription setup.
    connect_lock: Mutex<()>,
    /// Held across each publish so broker calls keep call order.
    session: Mutex<Option<ActiveSession>>,
    subscriptions: StdMutex<Vec<Arc<Subscription>>>,
    consumers: StdMutex<Vec<JoinHandle<()>>>,
    reconnect: StdMutex<ReconnectState>,
    handler_slots: Arc<Semaphore>,
    signals: mpsc::UnboundedSender<Signal>,
    pending_signals: StdMutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    next_subscription: AtomicU64,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once `closing` flips to `true`.
async fn closed(mut closing: watch::Receiver<bool>) {
    while !*closing.borrow_and_update() {
        if closing.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Process-wide event bus handle for one service instance.
///
/// Cloning is cheap and every clone drives the same connection. Build one in
/// the service's composition root and hand it to whatever needs to publish or
/// subscribe.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("service", &self.inner.config.service_name)
            .field("exchange", &self.inner.config.exchange)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Builder for an [`EventBus`] with custom clock or scheduler.
pub struct EventBusBuilder {
    config: BusConfig,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl EventBusBuilder {
    /// Clock used to stamp outgoing envelopes.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Scheduler used for reconnect backoff.
    #[must_use]
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Build the [`EventBus`]. Nothing touches the broker until `connect()`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the configuration is
    /// unusable, for example a zero prefetch or zero reconnect attempts.
    pub fn build(self) -> Result<EventBus, ConfigError> {
        self.config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (closing, _) = watch::channel(false);
        let (signals, pending) = mpsc::unbounded_channel();
        let reconnect = ReconnectState::new(&self.config.reconnect);
        let handler_slots = Arc::new(Semaphore::new(usize::from(self.config.prefetch)));

        Ok(EventBus {
            inner: Arc::new(Inner {
                config: self.config,
                broker: self.broker,
                clock: self.clock,
                sleeper: self.sleeper,
                state,
                closing,
                connect_lock: Mutex::new(()),
                session: Mutex::new(None),
                subscriptions: StdMutex::new(Vec::new()),
                consumers: StdMutex::new(Vec::new()),
                reconnect: StdMutex::new(reconnect),
                handler_slots,
                signals,
                pending_signals: StdMutex::new(Some(pending)),
                supervisor: StdMutex::new(None),
                generation: AtomicU64::new(0),
                next_subscription: AtomicU64::new(1),
            }),
        })
    }
}

impl EventBus {
    /// Create an event bus with the system clock and tokio timers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the configuration is unusable.
    pub fn new(config: BusConfig, broker: Arc<dyn Broker>) -> Result<Self, ConfigError> {
        Self::builder(config, broker).build()
    }

    /// Start building an event bus.
    #[must_use]
    pub fn builder(config: BusConfig, broker: Arc<dyn Broker>) -> EventBusBuilder {
        EventBusBuilder {
            config,
            broker,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Configuration this bus was built with.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether publish and subscribe can reach the broker right now.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the connection state satisfies `predicate`, returning that state.
    pub async fn wait_for_state<F>(&self, predicate: F) -> ConnectionState
    where
        F: Fn(ConnectionState) -> bool,
    {
        let mut changes = self.state_changes();
        loop {
            let current = *changes.borrow_and_update();
            if predicate(current) {
                return current;
            }
            if changes.changed().await.is_err() {
                return current;
            }
        }
    }

    /// Reconnect attempts made since the last successful connect.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        lock(&self.inner.reconnect).attempt()
    }

    /// Readiness report for health checks.
    #[must_use]
    pub fn health(&self) -> ComponentHealth {
        let state = self.state();
        let attempt = self.reconnect_attempt();
        let health = match state {
            ConnectionState::Connected => {
                ComponentHealth::healthy(COMPONENT_NAME, "Connected to broker")
            },
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                ComponentHealth::degraded(COMPONENT_NAME, "Not connected to broker")
                    .with_detail("reconnect_attempt", attempt)
            },
            ConnectionState::Exhausted => {
                ComponentHealth::unhealthy(COMPONENT_NAME, "Max reconnection attempts reached")
                    .with_detail("reconnect_attempt", attempt)
            },
        };
        health.with_detail("state", state.to_string())
    }

    /// Connect to the broker and declare the exchange.
    ///
    /// Resets the reconnect budget. On failure the error is logged, the bus is
    /// marked disconnected and the reconnect policy takes over in the
    /// background; the error is returned so the caller can decide whether to
    /// keep starting up.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] (or the broker's transport
    /// error) if the handshake or exchange declaration fails.
    pub async fn connect(&self) -> Result<(), EventBusError> {
        self.inner.closing.send_replace(false);
        self.inner.ensure_supervisor();
        lock(&self.inner.reconnect).reset();

        match self.inner.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(
                    url = %self.inner.config.redacted_url(),
                    error = %e,
                    "Failed to connect to broker"
                );
                self.inner.set_state(ConnectionState::Disconnected);
                let _ = self.inner.signals.send(Signal::ConnectFailed);
                Err(e)
            },
        }
    }

    /// Publish an envelope under `routing_key`.
    ///
    /// Missing `timestamp` and `service` fields are filled in from the clock and
    /// configuration. Messages are published with persistent delivery mode and
    /// reach the broker in call order.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::NotConnected`] if there is no live connection; nothing
    ///   is sent and a warning is logged.
    /// - [`EventBusError::ReconnectExhausted`] instead, once the reconnect
    ///   policy has given up.
    /// - [`EventBusError::InvalidRoutingKey`] for wildcard or oversized keys.
    /// - [`EventBusError::PublishFailed`] if the broker rejects the frame.
    ///
    /// None of these are fatal; callers typically log and carry on.
    pub async fn publish(
        &self,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), EventBusError> {
        validate_routing_key(routing_key)?;

        let mut envelope = envelope.clone();
        if envelope.timestamp.is_none() {
            envelope.timestamp = Some(self.inner.clock.now());
        }
        if envelope.service.is_empty() {
            envelope.service.clone_from(&self.inner.config.service_name);
        }
        let body = envelope.to_bytes()?;

        let session = self.inner.session.lock().await;
        let Some(active) = session.as_ref() else {
            tracing::warn!(
                routing_key,
                event_type = %envelope.event_type,
                "Event bus not connected, message not published"
            );
            counter!(metrics::PUBLISH_FAILURES_TOTAL, "reason" => "not_connected").increment(1);
            return Err(self.inner.unavailable());
        };

        match active
            .channel
            .publish(&self.inner.config.exchange, routing_key, body)
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    routing_key,
                    event_type = %envelope.event_type,
                    exchange = %self.inner.config.exchange,
                    "Message published"
                );
                counter!(metrics::PUBLISHED_TOTAL).increment(1);
                Ok(())
            },
            Err(e) => {
                tracing::error!(
                    routing_key,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Failed to publish message"
                );
                counter!(metrics::PUBLISH_FAILURES_TOTAL, "reason" => "broker").increment(1);
                if e.is_connection_level() {
                    // A channel that failed a publish is unusable; start over.
                    let _ = self.inner.signals.send(Signal::Lost {
                        generation: active.generation,
                        cause: e.to_string(),
                    });
                }
                Err(EventBusError::PublishFailed {
                    routing_key: routing_key.to_string(),
                    reason: e.to_string(),
                })
            },
        }
    }

    /// Wrap `data` in a new envelope and publish it.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish), plus [`EventBusError::Serialization`]
    /// if `data` cannot be turned into JSON.
    pub async fn emit<T>(
        &self,
        routing_key: &str,
        event_type: &str,
        data: &T,
    ) -> Result<(), EventBusError>
    where
        T: Serialize + ?Sized,
    {
        let data =
            serde_json::to_value(data).map_err(|e| EventBusError::Serialization(e.to_string()))?;
        self.publish(routing_key, &Envelope::new(event_type, data)).await
    }

    /// Subscribe `handler` to one binding pattern.
    ///
    /// Messages arrive through a durable queue named
    /// `{queue_prefix}.{pattern}`, so every instance of the service shares the
    /// work and messages wait in the queue while the service is down.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::InvalidPattern`] if the pattern is malformed.
    /// - [`EventBusError::NotConnected`] if called before a successful `connect()`.
    /// - [`EventBusError::ReconnectExhausted`] once the reconnect policy has given up.
    /// - [`EventBusError::SubscriptionFailed`] if the broker rejects the queue,
    ///   binding or consumer.
    pub async fn subscribe<H>(
        &self,
        pattern: &str,
        handler: H,
    ) -> Result<SubscriptionId, EventBusError>
    where
        H: MessageHandler,
    {
        let queue = QueueSpec::named(format!("{}.{pattern}", self.inner.config.queue_prefix()));
        self.subscribe_with(SubscribeOptions::new(queue).bind(pattern), handler)
            .await
    }

    /// Subscribe `handler` through an explicit queue with one or more bindings.
    ///
    /// The subscription is permanent: after a reconnect its queue, bindings and
    /// consumer are set up again automatically.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub async fn subscribe_with<H>(
        &self,
        options: SubscribeOptions,
        handler: H,
    ) -> Result<SubscriptionId, EventBusError>
    where
        H: MessageHandler,
    {
        if options.patterns.is_empty() {
            return Err(EventBusError::InvalidPattern {
                pattern: String::new(),
                reason: "subscription needs at least one binding pattern".to_string(),
            });
        }
        let patterns = options
            .patterns
            .iter()
            .map(|p| TopicPattern::parse(p))
            .collect::<Result<Vec<_>, _>>()?;

        let _handshake = self.inner.connect_lock.lock().await;

        let (channel, generation) = {
            let session = self.inner.session.lock().await;
            match session.as_ref() {
                Some(active) => (Arc::clone(&active.channel), active.generation),
                None => {
                    tracing::error!(
                        patterns = ?options.patterns,
                        "Cannot subscribe: event bus is not connected"
                    );
                    return Err(self.inner.unavailable());
                },
            }
        };

        let id = SubscriptionId::new(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            id,
            queue: options.queue,
            patterns,
            handler: Arc::new(handler),
        });

        self.inner
            .start_consumer(&channel, &subscription, generation)
            .await?;
        lock(&self.inner.subscriptions).push(subscription);

        Ok(id)
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }

    /// Close the channel, then the connection.
    ///
    /// Stops consuming, waits for handlers already running to settle their
    /// messages, cancels any pending reconnect, and swallows (but logs) close
    /// errors so shutdown always completes. Calling it again is a no-op.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.closing.send_replace(true);

        let session = inner.session.lock().await.take();
        inner.stop_consumers();

        let Some(active) = session else {
            inner.set_state(ConnectionState::Disconnected);
            tracing::debug!("Event bus already closed");
            return;
        };
        active.watcher.abort();

        // Handlers still running hold a slot each; wait for them to settle.
        let slots = u32::from(inner.config.prefetch);
        if let Ok(all) = inner.handler_slots.acquire_many(slots).await {
            drop(all);
        }

        if let Err(e) = active.channel.close().await {
            tracing::warn!(error = %e, "Failed to close channel");
        }
        if let Err(e) = active.connection.close().await {
            tracing::warn!(error = %e, "Failed to close connection");
        }

        inner.set_state(ConnectionState::Disconnected);
        gauge!(metrics::CONNECTED).set(0.0);
        tracing::info!(service = %inner.config.service_name, "Event bus closed");
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Error for an operation that needs a session when there is none.
    fn unavailable(&self) -> EventBusError {
        if self.state() == ConnectionState::Exhausted {
            EventBusError::ReconnectExhausted {
                attempts: lock(&self.reconnect).attempt(),
            }
        } else {
            EventBusError::NotConnected
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!(from = %current, to = %next, "Connection state changed");
            *current = next;
            true
        });
    }

    fn ensure_supervisor(self: &Arc<Self>) {
        let mut supervisor = lock(&self.supervisor);
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Some(signals) = lock(&self.pending_signals).take() else {
            return;
        };
        *supervisor = Some(tokio::spawn(supervise(Arc::downgrade(self), signals)));
    }

    /// Open a session, declare the exchange and restore subscriptions.
    async fn establish(self: &Arc<Self>) -> Result<(), EventBusError> {
        let _handshake = self.connect_lock.lock().await;
        if self.session.lock().await.is_some() {
            return Ok(());
        }
        if self.is_closing() {
            return Err(EventBusError::Closed);
        }

        self.set_state(ConnectionState::Connecting);
        tracing::info!(
            url = %self.config.redacted_url(),
            exchange = %self.config.exchange,
            "Connecting to broker"
        );

        let BrokerSession {
            connection,
            channel,
            lost,
        } = self.broker.connect(&self.config.url).await?;

        if let Err(e) = self.prepare(channel.as_ref()).await {
            close_quietly(channel.as_ref(), connection.as_ref()).await;
            return Err(e);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut session = self.session.lock().await;
            if self.is_closing() {
                drop(session);
                close_quietly(channel.as_ref(), connection.as_ref()).await;
                return Err(EventBusError::Closed);
            }
            *session = Some(ActiveSession {
                channel: Arc::clone(&channel),
                connection,
                generation,
                watcher: self.watch_connection(generation, lost),
            });
        }

        let subscriptions = lock(&self.subscriptions).clone();
        for subscription in &subscriptions {
            if let Err(e) = self.start_consumer(&channel, subscription, generation).await {
                tracing::error!(
                    subscription = %subscription.id,
                    error = %e,
                    "Failed to restore subscription"
                );
                self.release_session(generation).await;
                return Err(e);
            }
        }

        lock(&self.reconnect).reset();
        self.set_state(ConnectionState::Connected);
        gauge!(metrics::CONNECTED).set(1.0);
        tracing::info!(
            exchange = %self.config.exchange,
            subscriptions = subscriptions.len(),
            generation,
            "Connected to broker"
        );
        Ok(())
    }

    async fn prepare(&self, channel: &dyn BrokerChannel) -> Result<(), EventBusError> {
        channel.declare_exchange(&self.config.exchange).await?;
        channel.set_prefetch(self.config.prefetch).await
    }

    fn watch_connection(&self, generation: u64, lost: oneshot::Receiver<String>) -> JoinHandle<()> {
        let signals = self.signals.clone();
        tokio::spawn(async move {
            // A dropped sender is a graceful close.
            if let Ok(cause) = lost.await {
                let _ = signals.send(Signal::Lost { generation, cause });
            }
        })
    }

    async fn start_consumer(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        subscription: &Arc<Subscription>,
        generation: u64,
    ) -> Result<(), EventBusError> {
        let failed = |e: EventBusError| EventBusError::SubscriptionFailed {
            pattern: subscription.pattern_list(),
            reason: e.to_string(),
        };

        let queue = channel
            .declare_queue(&subscription.queue)
            .await
            .map_err(failed)?;
        for pattern in &subscription.patterns {
            channel
                .bind_queue(&queue, &self.config.exchange, pattern.as_str())
                .await
                .map_err(failed)?;
        }

        let tag = format!("{}-{}-{generation}", self.config.service_name, subscription.id);
        let deliveries = channel.consume(&queue, &tag).await.map_err(failed)?;

        tracing::info!(
            subscription = %subscription.id,
            queue = %queue,
            patterns = %subscription.pattern_list(),
            consumer_tag = %tag,
            "Subscribed"
        );

        let signals = self.signals.clone();
        let subscription = Arc::clone(subscription);
        let slots = Arc::clone(&self.handler_slots);
        let task = tokio::spawn(async move {
            consumer::run(subscription, queue, deliveries, slots).await;
            let _ = signals.send(Signal::Lost {
                generation,
                cause: "consumer stream ended".to_string(),
            });
        });
        lock(&self.consumers).push(task);
        Ok(())
    }

    fn stop_consumers(&self) {
        for task in lock(&self.consumers).drain(..) {
            task.abort();
        }
    }

    /// Drop the session if it is still `generation`. Returns whether it was.
    async fn release_session(&self, generation: u64) -> bool {
        let active = {
            let mut session = self.session.lock().await;
            match session.as_ref() {
                Some(active) if active.generation == generation => session.take(),
                _ => return false,
            }
        };
        self.stop_consumers();
        if let Some(active) = active {
            active.watcher.abort();
            close_quietly(active.channel.as_ref(), active.connection.as_ref()).await;
        }
        self.set_state(ConnectionState::Disconnected);
        gauge!(metrics::CONNECTED).set(0.0);
        true
    }

    /// Backoff loop. Returns when connected, exhausted or closing.
    async fn reconnect(self: &Arc<Self>) {
        loop {
            let next = lock(&self.reconnect).next_attempt();
            let Some((attempt, delay)) = next else {
                let attempts = lock(&self.reconnect).attempt();
                tracing::error!(
                    attempts,
                    "Max reconnection attempts reached, giving up on broker"
                );
                self.set_state(ConnectionState::Exhausted);
                return;
            };

            tracing::info!(
                attempt,
                max_attempts = lock(&self.reconnect).max_attempts(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Scheduling reconnect"
            );

            tokio::select! {
                () = self.sleeper.sleep(delay) => {},
                () = closed(self.closing.subscribe()) => {
                    tracing::debug!(attempt, "Pending reconnect cancelled by close");
                    return;
                },
            }

            counter!(metrics::RECONNECT_ATTEMPTS_TOTAL).increment(1);
            match self.establish().await {
                Ok(()) => {
                    tracing::info!(attempt, "Reconnected to broker");
                    return;
                },
                Err(EventBusError::Closed) => return,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    self.set_state(ConnectionState::Disconnected);
                },
            }
        }
    }
}

async fn supervise(inner: Weak<Inner>, mut signals: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.is_closing() {
            continue;
        }

        match signal {
            Signal::Lost { generation, cause } => {
                if !inner.release_session(generation).await {
                    continue;
                }
                tracing::warn!(cause = %cause, generation, "Broker connection lost");
            },
            Signal::ConnectFailed => {
                if matches!(
                    inner.state(),
                    ConnectionState::Connected | ConnectionState::Exhausted
                ) {
                    continue;
                }
            },
        }

        inner.reconnect().await;
    }
    tracing::debug!("Event bus supervisor exiting");
}

async fn close_quietly(channel: &dyn BrokerChannel, connection: &dyn BrokerConnection) {
    if let Err(e) = channel.close().await {
        tracing::debug!(error = %e, "Failed to close channel of abandoned session");
    }
    if let Err(e) = connection.close().await {
        tracing::debug!(error = %e, "Failed to close abandoned connection");
    }
}
