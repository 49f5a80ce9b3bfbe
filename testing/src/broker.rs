//! In-memory topic broker.
//!
//! Implements the [`Broker`] seam with the routing and acknowledgement rules of
//! an AMQP topic exchange, so the event bus can be tested end to end without a
//! running broker:
//!
//! - a published message lands once in every queue with a matching binding
//! - each queue hands messages round-robin to its consumers, holding back when
//!   a consumer's channel has `prefetch` unacknowledged messages
//! - nack with requeue puts the message back at the head of its queue with
//!   `redelivered = true`; nack without requeue drops it
//! - dropping a connection requeues everything its channels had not settled,
//!   deletes its exclusive queues and fires the session's `lost` signal
//!
//! Failure injection ([`fail_next_connects`](InMemoryBroker::fail_next_connects),
//! [`set_unreachable`](InMemoryBroker::set_unreachable),
//! [`fail_next_publishes`](InMemoryBroker::fail_next_publishes),
//! [`drop_connections`](InMemoryBroker::drop_connections)) drives the
//! reconnect paths.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use hometrip_events_core::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerFuture, BrokerSession, Delivery,
    DeliveryStream, EventBusError, QueueSpec, TopicPattern,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};

type Shared = Arc<Mutex<State>>;

/// A message as it passed through the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Exchange it was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// Raw body
    pub body: Vec<u8>,
}

impl BrokerMessage {
    /// Body parsed as JSON, or `Value::Null` if it is not JSON.
    #[must_use]
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

impl Message {
    fn record(&self) -> BrokerMessage {
        BrokerMessage {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            body: self.body.clone(),
        }
    }
}

struct Consumer {
    tag: String,
    channel: u64,
    deliveries: mpsc::UnboundedSender<Result<Delivery, EventBusError>>,
}

struct Unacked {
    message: Message,
    channel: u64,
}

#[derive(Default)]
struct Queue {
    exclusive_owner: Option<u64>,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    unacked: BTreeMap<u64, Unacked>,
}

struct Binding {
    queue: String,
    exchange: String,
    pattern: TopicPattern,
}

struct ConnectionEntry {
    open: bool,
    lost: Option<oneshot::Sender<String>>,
}

struct ChannelEntry {
    connection: u64,
    open: bool,
    prefetch: u16,
}

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    published: Vec<BrokerMessage>,
    acked: Vec<BrokerMessage>,
    discarded: Vec<BrokerMessage>,
    requeued: usize,
    connect_attempts: usize,
    fail_connects: usize,
    unreachable: bool,
    fail_publishes: usize,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_is_open(&self, channel: u64) -> bool {
        self.channels.get(&channel).is_some_and(|c| c.open)
    }

    fn in_flight(&self, channel: u64) -> usize {
        self.queues
            .values()
            .flat_map(|q| q.unacked.values())
            .filter(|u| u.channel == channel)
            .count()
    }

    fn has_capacity(&self, channel: u64) -> bool {
        match self.channels.get(&channel) {
            Some(entry) if entry.open => {
                entry.prefetch == 0 || self.in_flight(channel) < usize::from(entry.prefetch)
            },
            _ => false,
        }
    }

    /// Remove a channel's consumers and requeue what it had not settled.
    fn close_channel(&mut self, channel: u64) -> Vec<String> {
        if let Some(entry) = self.channels.get_mut(&channel) {
            entry.open = false;
        }

        let mut touched = Vec::new();
        for (name, queue) in &mut self.queues {
            queue.consumers.retain(|c| c.channel != channel);

            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel == channel)
                .map(|(tag, _)| *tag)
                .collect();
            // Oldest delivery ends up at the head again.
            for tag in tags.into_iter().rev() {
                if let Some(mut unacked) = queue.unacked.remove(&tag) {
                    unacked.message.redelivered = true;
                    queue.ready.push_front(unacked.message);
                }
            }
            touched.push(name.clone());
        }
        touched
    }

    fn close_connection(&mut self, connection: u64) -> Vec<String> {
        if let Some(entry) = self.connections.get_mut(&connection) {
            entry.open = false;
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection && c.open)
            .map(|(id, _)| *id)
            .collect();
        let mut touched = Vec::new();
        for channel in channels {
            touched.extend(self.close_channel(channel));
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.exclusive_owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            self.queues.remove(name);
        }
        self.bindings.retain(|b| !exclusive.contains(&b.queue));

        touched.sort();
        touched.dedup();
        touched
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, State> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hand ready messages to consumers with spare prefetch.
fn dispatch(shared: &Shared, state: &mut State, queue_name: &str) {
    loop {
        let Some(queue) = state.queues.get(queue_name) else {
            return;
        };
        if queue.ready.is_empty() || queue.consumers.is_empty() {
            return;
        }

        let count = queue.consumers.len();
        let start = queue.next_consumer % count;
        let Some(index) = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&i| state.has_capacity(queue.consumers[i].channel))
        else {
            return;
        };

        let tag = state.next_id();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let Some(message) = queue.ready.pop_front() else {
            return;
        };
        queue.next_consumer = index + 1;

        let delivery = Delivery {
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            redelivered: message.redelivered,
            acker: Box::new(MemoryAcker {
                state: Arc::downgrade(shared),
                queue: queue_name.to_string(),
                tag,
            }),
        };

        let channel = queue.consumers[index].channel;
        if queue.consumers[index].deliveries.send(Ok(delivery)).is_err() {
            // Consumer stream dropped: forget it and retry the message.
            queue.consumers.remove(index);
            queue.ready.push_front(message);
            continue;
        }
        queue.unacked.insert(tag, Unacked { message, channel });
    }
}

fn dispatch_all(shared: &Shared, state: &mut State, queues: &[String]) {
    for queue in queues {
        dispatch(shared, state, queue);
    }
}

/// In-memory AMQP-style topic broker for tests.
///
/// Cloning shares the broker, so a test keeps one handle for inspection and
/// failure injection while the bus owns another.
///
/// # Example
///
/// ```
/// use hometrip_events_testing::InMemoryBroker;
/// use hometrip_events_core::{Broker, QueueSpec};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let session = broker.connect("amqp://localhost").await?;
///
/// session.channel.declare_exchange("hometrip_events").await?;
/// let queue = session.channel.declare_queue(&QueueSpec::named("bookings")).await?;
/// session.channel.bind_queue(&queue, "hometrip_events", "booking.*").await?;
/// session.channel.publish("hometrip_events", "booking.completed", b"{}".to_vec()).await?;
///
/// assert_eq!(broker.queue_depth("bookings"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Shared,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &state.exchanges)
            .field("queues", &state.queues.keys().collect::<Vec<_>>())
            .field("published", &state.published.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryBroker {
    /// Create an empty broker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        lock(&self.state).fail_connects = count;
    }

    /// Refuse (or accept again) every connection attempt.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        lock(&self.state).fail_publishes = count;
    }

    /// Drop each open session's `lost` sender without failing anything.
    ///
    /// Connections stay open; this is what a client library does when it
    /// tears down its error callbacks on a clean exit.
    pub fn release_loss_signals(&self) {
        let mut state = lock(&self.state);
        for connection in state.connections.values_mut().filter(|c| c.open) {
            connection.lost = None;
        }
    }

    /// Kill every open connection as if the network dropped.
    ///
    /// Unsettled deliveries go back to their queues, exclusive queues are
    /// deleted and each session's `lost` signal fires with `cause`.
    pub fn drop_connections(&self, cause: &str) {
        let mut state = lock(&self.state);
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();

        let mut touched = Vec::new();
        for id in open {
            touched.extend(state.close_connection(id));
            if let Some(lost) = state
                .connections
                .get_mut(&id)
                .and_then(|c| c.lost.take())
            {
                let _ = lost.send(cause.to_string());
            }
        }
        dispatch_all(&self.state, &mut state, &touched);
    }

    /// Route a raw body, bypassing any client-side encoding.
    ///
    /// Does nothing if `exchange` was never declared.
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) {
        let mut state = lock(&self.state);
        if !state.exchanges.contains(exchange) {
            return;
        }
        route(
            &self.state,
            &mut state,
            Message {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.into(),
                redelivered: false,
            },
        );
    }

    /// Every message accepted by an exchange, in order.
    #[must_use]
    pub fn published(&self) -> Vec<BrokerMessage> {
        lock(&self.state).published.clone()
    }

    /// Number of messages accepted by an exchange.
    #[must_use]
    pub fn published_count(&self) -> usize {
        lock(&self.state).published.len()
    }

    /// Messages acknowledged by consumers.
    #[must_use]
    pub fn acked(&self) -> Vec<BrokerMessage> {
        lock(&self.state).acked.clone()
    }

    /// Number of acknowledgements.
    #[must_use]
    pub fn acked_count(&self) -> usize {
        lock(&self.state).acked.len()
    }

    /// Number of nacks with requeue.
    #[must_use]
    pub fn requeued_count(&self) -> usize {
        lock(&self.state).requeued
    }

    /// Messages nacked without requeue.
    #[must_use]
    pub fn discarded(&self) -> Vec<BrokerMessage> {
        lock(&self.state).discarded.clone()
    }

    /// Number of nacks without requeue.
    #[must_use]
    pub fn discarded_count(&self) -> usize {
        lock(&self.state).discarded.len()
    }

    /// Messages waiting in `queue` (not yet delivered).
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` but not yet settled.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Consumers attached to `queue`.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Whether `queue` exists.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    /// Names of all queues, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Binding patterns from `exchange` to `queue`.
    #[must_use]
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        lock(&self.state)
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.pattern.as_str().to_string())
            .collect()
    }

    /// Whether `exchange` has been declared.
    #[must_use]
    pub fn has_exchange(&self, exchange: &str) -> bool {
        lock(&self.state).exchanges.contains(exchange)
    }

    /// Connection attempts seen, successful or not.
    #[must_use]
    pub fn connection_attempts(&self) -> usize {
        lock(&self.state).connect_attempts
    }

    /// Connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        lock(&self.state)
            .connections
            .values()
            .filter(|c| c.open)
            .count()
    }

    /// Channels currently open.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        lock(&self.state).channels.values().filter(|c| c.open).count()
    }
}

fn route(shared: &Shared, state: &mut State, message: Message) {
    state.published.push(message.record());

    let mut targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|b| b.exchange == message.exchange && b.pattern.matches(&message.routing_key))
        .map(|b| b.queue.clone())
        .collect();
    targets.sort();
    targets.dedup();

    for queue in &targets {
        if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_back(message.clone());
        }
    }
    dispatch_all(shared, state, &targets);
}

fn closed() -> EventBusError {
    EventBusError::Transport("channel closed".to_string())
}

fn not_found(kind: &str, name: &str) -> EventBusError {
    EventBusError::Transport(format!("NOT_FOUND - no {kind} '{name}'"))
}

impl Broker for InMemoryBroker {
    fn connect(&self, _url: &str) -> BrokerFuture<'_, BrokerSession> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.connect_attempts += 1;
            if state.unreachable {
                return Err(EventBusError::ConnectionFailed("connection refused".to_string()));
            }
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(EventBusError::ConnectionFailed("connection refused".to_string()));
            }

            let (lost_tx, lost_rx) = oneshot::channel();
            let connection = state.next_id();
            let channel = state.next_id();
            state.connections.insert(
                connection,
                ConnectionEntry {
                    open: true,
                    lost: Some(lost_tx),
                },
            );
            state.channels.insert(
                channel,
                ChannelEntry {
                    connection,
                    open: true,
                    prefetch: 0,
                },
            );

            Ok(BrokerSession {
                connection: Box::new(MemoryConnection {
                    state: Arc::clone(&self.state),
                    id: connection,
                }),
                channel: Arc::new(MemoryChannel {
                    state: Arc::clone(&self.state),
                    id: channel,
                    connection,
                }),
                lost: lost_rx,
            })
        })
    }
}

struct MemoryConnection {
    state: Shared,
    id: u64,
}

impl BrokerConnection for MemoryConnection {
    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let touched = state.close_connection(self.id);
            // A graceful close never reports the connection as lost.
            if let Some(entry) = state.connections.get_mut(&self.id) {
                entry.lost = None;
            }
            dispatch_all(&self.state, &mut state, &touched);
            Ok(())
        })
    }
}

struct MemoryChannel {
    state: Shared,
    id: u64,
    connection: u64,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, State>, EventBusError> {
        let state = lock(&self.state);
        if state.channel_is_open(self.id) {
            Ok(state)
        } else {
            Err(closed())
        }
    }
}

impl BrokerChannel for MemoryChannel {
    fn declare_exchange(&self, exchange: &str) -> BrokerFuture<'_, ()> {
        let exchange = exchange.to_string();
        Box::pin(async move {
            self.open_state()?.exchanges.insert(exchange);
            Ok(())
        })
    }

    fn declare_queue(&self, spec: &QueueSpec) -> BrokerFuture<'_, String> {
        let spec = spec.clone();
        Box::pin(async move {
            let mut state = self.open_state()?;
            let name = match spec.name {
                Some(name) => name,
                None => format!("amq.gen-{}", state.next_id()),
            };
            if let Some(existing) = state.queues.get(&name) {
                if existing
                    .exclusive_owner
                    .is_some_and(|owner| owner != self.connection)
                {
                    return Err(EventBusError::Transport(format!(
                        "RESOURCE_LOCKED - queue '{name}' is exclusive to another connection"
                    )));
                }
                return Ok(name);
            }
            state.queues.insert(
                name.clone(),
                Queue {
                    exclusive_owner: spec.exclusive.then_some(self.connection),
                    ..Queue::default()
                },
            );
            Ok(name)
        })
    }

    fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BrokerFuture<'_, ()> {
        let (queue, exchange, pattern) =
            (queue.to_string(), exchange.to_string(), pattern.to_string());
        Box::pin(async move {
            let pattern = TopicPattern::parse(&pattern)?;
            let mut state = self.open_state()?;
            if !state.exchanges.contains(&exchange) {
                return Err(not_found("exchange", &exchange));
            }
            if !state.queues.contains_key(&queue) {
                return Err(not_found("queue", &queue));
            }
            let exists = state
                .bindings
                .iter()
                .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
            if !exists {
                state.bindings.push(Binding {
                    queue,
                    exchange,
                    pattern,
                });
            }
            Ok(())
        })
    }

    fn set_prefetch(&self, count: u16) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.open_state()?;
            if let Some(entry) = state.channels.get_mut(&self.id) {
                entry.prefetch = count;
            }
            Ok(())
        })
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> BrokerFuture<'_, ()> {
        let (exchange, routing_key) = (exchange.to_string(), routing_key.to_string());
        Box::pin(async move {
            let mut state = self.open_state()?;
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(EventBusError::PublishFailed {
                    routing_key,
                    reason: "rejected by broker".to_string(),
                });
            }
            if !state.exchanges.contains(&exchange) {
                return Err(not_found("exchange", &exchange));
            }
            route(
                &self.state,
                &mut state,
                Message {
                    exchange,
                    routing_key,
                    body,
                    redelivered: false,
                },
            );
            Ok(())
        })
    }

    fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerFuture<'_, DeliveryStream> {
        let (queue, tag) = (queue.to_string(), consumer_tag.to_string());
        Box::pin(async move {
            let mut state = self.open_state()?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            let Some(q) = state.queues.get_mut(&queue) else {
                return Err(not_found("queue", &queue));
            };
            if q.consumers.iter().any(|c| c.tag == tag) {
                return Err(EventBusError::Transport(format!(
                    "NOT_ALLOWED - consumer tag '{tag}' in use"
                )));
            }
            q.consumers.push(Consumer {
                tag,
                channel: self.id,
                deliveries: tx,
            });
            dispatch(&self.state, &mut state, &queue);

            let stream: DeliveryStream = Box::pin(async_stream::stream! {
                while let Some(delivery) = rx.recv().await {
                    yield delivery;
                }
            });
            Ok(stream)
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if !state.channel_is_open(self.id) {
                return Ok(());
            }
            let touched = state.close_channel(self.id);
            dispatch_all(&self.state, &mut state, &touched);
            Ok(())
        })
    }
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, apply: impl FnOnce(&mut State, Message)) -> Result<(), EventBusError> {
        let shared = self.state.upgrade().ok_or_else(closed)?;
        let mut state = lock(&shared);
        let unacked = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .ok_or_else(|| {
                EventBusError::Transport(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    self.tag
                ))
            })?;
        if !state.channel_is_open(unacked.channel) {
            return Err(closed());
        }
        apply(&mut *state, unacked.message);
        dispatch(&shared, &mut state, &self.queue);
        Ok(())
    }
}

impl Acknowledger for MemoryAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.settle(|state, message| state.acked.push(message.record()))
        })
    }

    fn nack(&self, requeue: bool) -> BrokerFuture<'_, ()> {
        let queue = self.queue.clone();
        Box::pin(async move {
            self.settle(move |state, mut message| {
                if requeue {
                    state.requeued += 1;
                    message.redelivered = true;
                    if let Some(q) = state.queues.get_mut(&queue) {
                        q.ready.push_front(message);
                    }
                } else {
                    state.discarded.push(message.record());
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    const EXCHANGE: &str = "hometrip_events";

    async fn session(broker: &InMemoryBroker) -> BrokerSession {
        let session = broker.connect("amqp://test").await.unwrap();
        session.channel.declare_exchange(EXCHANGE).await.unwrap();
        session
    }

    async fn bound_queue(session: &BrokerSession, name: &str, pattern: &str) {
        let queue = session.channel.declare_queue(&QueueSpec::named(name)).await.unwrap();
        session.channel.bind_queue(&queue, EXCHANGE, pattern).await.unwrap();
    }

    #[tokio::test]
    async fn routes_to_every_matching_queue_once() {
        let broker = InMemoryBroker::new();
        let session = session(&broker).await;
        bound_queue(&session, "bookings", "booking.*").await;
        bound_queue(&session, "everything", "#").await;
        // Two matching bindings on one queue still deliver once.
        session.channel.bind_queue("everything", EXCHANGE, "booking.#").await.unwrap();

        session.channel.publish(EXCHANGE, "booking.completed", b"{}".to_vec()).await.unwrap();
        session.channel.publish(EXCHANGE, "user.deleted", b"{}".to_vec()).await.unwrap();

        assert_eq!(broker.queue_depth("bookings"), 1);
        assert_eq!(broker.queue_depth("everything"), 2);
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn requeue_goes_to_head_marked_redelivered() {
        let broker = InMemoryBroker::new();
        let session = session(&broker).await;
        bound_queue(&session, "bookings", "booking.*").await;
        session.channel.set_prefetch(1).await.unwrap();

        session.channel.publish(EXCHANGE, "booking.first", b"1".to_vec()).await.unwrap();
        session.channel.publish(EXCHANGE, "booking.second", b"2".to_vec()).await.unwrap();

        let mut stream = session.channel.consume("bookings", "c1").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.routing_key, "booking.first");
        assert!(!first.redelivered);
        // Prefetch 1 holds the second message back.
        assert_eq!(broker.queue_depth("bookings"), 1);

        first.acker.nack(true).await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.routing_key, "booking.first");
        assert!(again.redelivered);

        again.acker.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.routing_key, "booking.second");
        second.acker.nack(false).await.unwrap();

        assert_eq!(broker.acked_count(), 1);
        assert_eq!(broker.requeued_count(), 1);
        assert_eq!(broker.discarded_count(), 1);
        assert_eq!(broker.queue_depth("bookings"), 0);
    }

    #[tokio::test]
    async fn dropped_connection_requeues_and_signals_lost() {
        let broker = InMemoryBroker::new();
        let session = session(&broker).await;
        bound_queue(&session, "bookings", "booking.*").await;
        let exclusive = session.channel.declare_queue(&QueueSpec::exclusive()).await.unwrap();
        session.channel.publish(EXCHANGE, "booking.completed", b"{}".to_vec()).await.unwrap();

        let mut stream = session.channel.consume("bookings", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("bookings"), 1);

        broker.drop_connections("network down");

        assert_eq!(session.lost.await.unwrap(), "network down");
        assert_eq!(broker.queue_depth("bookings"), 1);
        assert!(!broker.has_queue(&exclusive));
        assert!(delivery.acker.ack().await.is_err());
        assert!(stream.next().await.is_none());
        assert!(session.channel.publish(EXCHANGE, "booking.x", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn connect_failures_are_counted() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);

        assert!(broker.connect("amqp://test").await.is_err());
        assert!(broker.connect("amqp://test").await.is_err());
        assert!(broker.connect("amqp://test").await.is_ok());
        assert_eq!(broker.connection_attempts(), 3);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn graceful_close_does_not_fire_lost() {
        let broker = InMemoryBroker::new();
        let session = session(&broker).await;

        session.channel.close().await.unwrap();
        session.connection.close().await.unwrap();

        assert!(session.lost.await.is_err());
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.open_channels(), 0);
    }
}
