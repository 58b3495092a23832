//! In-memory implementation of the broker traits for testing and development

use crate::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BusError, BusResult, ConnectionEvent,
    Delivery, DeliveryStream, ExchangeKind,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, Notify};
use tracing::debug;

/// Broker implementation using in-process queues
///
/// This implementation is suitable for:
/// - Unit and integration tests (no RabbitMQ required)
/// - Local development of consumers
///
/// It models the parts of AMQP 0-9-1 consumers rely on: exchanges with
/// queue bindings, the default exchange, per-consumer prefetch,
/// ack/nack/reject with requeue, and redelivery of unacked messages when a
/// channel or connection closes. Every exchange routes on the exact binding
/// key; the declared kind is only checked for redeclaration conflicts.
///
/// Faults can be injected to exercise reconnect logic: refused connections,
/// failing queue declarations, broker-initiated connection close.
///
/// # Example
/// ```rust
/// use event_bus::{Broker, InMemoryBroker};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let connection = broker.connect("memory://").await?;
/// let channel = connection.channel().await?;
/// channel.declare_queue("jobs").await?;
///
/// broker.enqueue("jobs", b"hello".to_vec())?;
///
/// let mut deliveries = channel.consume("jobs", "worker-1", false).await?;
/// let delivery = deliveries.next().await.unwrap()?;
/// assert_eq!(delivery.payload, b"hello");
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    // Woken on every state change that can unblock a consumer
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    unacked: HashMap<u64, Unacked>,
    connections: HashMap<u64, ConnectionSlot>,
    next_id: u64,
    next_tag: u64,
    connect_attempts: usize,
    failing_connects: usize,
    unavailable: bool,
    failing_queues: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    connection_id: u64,
    channel_id: u64,
    consumer_id: u64,
    message: StoredMessage,
}

struct ConnectionSlot {
    open: bool,
    events: broadcast::Sender<ConnectionEvent>,
}

enum Take {
    Ready(u64, StoredMessage),
    Empty,
    Closed,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_consumers(&self) {
        self.inner.notify.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.state().failing_connects = count;
    }

    /// Refuse every connection attempt until called again with `false`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Make declarations of `queue` fail with a precondition error
    pub fn fail_queue_declare(&self, queue: &str) {
        self.state().failing_queues.insert(queue.to_string());
    }

    pub fn clear_queue_declare_failures(&self) {
        self.state().failing_queues.clear();
    }

    /// Close every open connection from the broker side, as a restart would
    pub fn close_all_connections(&self, reason: &str) {
        let ids: Vec<u64> = self
            .state()
            .connections
            .iter()
            .filter(|(_, slot)| slot.open)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            self.close_connection(id, reason);
        }
    }

    /// Emit a connection-level error without closing anything
    pub fn emit_connection_error(&self, message: &str) {
        let state = self.state();
        for slot in state.connections.values().filter(|slot| slot.open) {
            let _ = slot.events.send(ConnectionEvent::Error(message.to_string()));
        }
    }

    // ------------------------------------------------------------------
    // Producer side helpers
    // ------------------------------------------------------------------

    /// Publish without holding a connection (acts like an external producer)
    pub fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> BusResult<()> {
        self.route(exchange, routing_key, payload)
    }

    /// Publish straight into `queue` through the default exchange
    pub fn enqueue(&self, queue: &str, payload: Vec<u8>) -> BusResult<()> {
        self.route("", queue, payload)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state()
            .connections
            .values()
            .filter(|slot| slot.open)
            .count()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state().bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        })
    }

    /// Number of messages ready for delivery in `queue`
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(VecDeque::len).unwrap_or(0)
    }

    /// Deliveries handed to a consumer and not yet settled
    pub fn unacked(&self) -> usize {
        self.state().unacked.len()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn connection_open(&self, connection_id: u64) -> bool {
        self.state()
            .connections
            .get(&connection_id)
            .map(|slot| slot.open)
            .unwrap_or(false)
    }

    fn close_connection(&self, connection_id: u64, reason: &str) {
        {
            let mut state = self.state();
            let Some(slot) = state.connections.get_mut(&connection_id) else {
                return;
            };
            if !slot.open {
                return;
            }
            slot.open = false;
            let _ = slot.events.send(ConnectionEvent::Closed(reason.to_string()));
            requeue_unacked(&mut state, |u| u.connection_id == connection_id);
        }
        debug!(connection_id, reason, "InMemoryBroker: connection closed");
        self.wake_consumers();
    }

    fn close_channel(&self, channel_id: u64) {
        requeue_unacked(&mut self.state(), |u| u.channel_id == channel_id);
        self.wake_consumers();
    }

    fn next_id(&self) -> u64 {
        let mut state = self.state();
        state.next_id += 1;
        state.next_id
    }

    fn route(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> BusResult<()> {
        {
            let mut state = self.state();

            let targets: Vec<String> = if exchange.is_empty() {
                vec![routing_key.to_string()]
            } else {
                if !state.exchanges.contains_key(exchange) {
                    return Err(BusError::PublishError(format!(
                        "NOT_FOUND - no exchange '{}'",
                        exchange
                    )));
                }
                state
                    .bindings
                    .iter()
                    .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
                    .map(|b| b.queue.clone())
                    .collect()
            };

            // Unroutable messages are dropped, as AMQP does without `mandatory`
            for queue in targets {
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.push_back(StoredMessage {
                        routing_key: routing_key.to_string(),
                        payload: payload.clone(),
                        redelivered: false,
                    });
                }
            }
        }

        self.wake_consumers();
        Ok(())
    }

    fn take_next(
        &self,
        queue: &str,
        connection_id: u64,
        channel_id: u64,
        consumer_id: u64,
        channel_open: &AtomicBool,
        prefetch: u16,
        no_ack: bool,
    ) -> Take {
        let mut state = self.state();

        let connection_open = state
            .connections
            .get(&connection_id)
            .map(|slot| slot.open)
            .unwrap_or(false);
        if !connection_open || !channel_open.load(Ordering::SeqCst) {
            return Take::Closed;
        }

        if !no_ack && prefetch > 0 {
            let in_flight = state
                .unacked
                .values()
                .filter(|u| u.consumer_id == consumer_id)
                .count();
            if in_flight >= usize::from(prefetch) {
                return Take::Empty;
            }
        }

        let Some(message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Take::Empty;
        };

        state.next_tag += 1;
        let tag = state.next_tag;

        if !no_ack {
            state.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    connection_id,
                    channel_id,
                    consumer_id,
                    message: message.clone(),
                },
            );
        }

        Take::Ready(tag, message)
    }

    fn settle(
        &self,
        delivery_tag: u64,
        connection_id: u64,
        channel_open: &AtomicBool,
        requeue: bool,
    ) -> BusResult<()> {
        if !channel_open.load(Ordering::SeqCst) || !self.connection_open(connection_id) {
            return Err(BusError::AckError(format!(
                "channel closed before delivery {} was settled",
                delivery_tag
            )));
        }

        {
            let mut state = self.state();
            let entry = state.unacked.remove(&delivery_tag).ok_or_else(|| {
                BusError::AckError(format!("unknown delivery tag {}", delivery_tag))
            })?;

            if let Some(q) = state.queues.get_mut(&entry.queue).filter(|_| requeue) {
                q.push_front(StoredMessage {
                    redelivered: true,
                    ..entry.message
                });
            }
        }

        self.wake_consumers();
        Ok(())
    }
}

/// Return matching unacked deliveries to the head of their queues, keeping
/// their original relative order
fn requeue_unacked(state: &mut BrokerState, predicate: impl Fn(&Unacked) -> bool) {
    let mut tags: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, u)| predicate(u))
        .map(|(tag, _)| *tag)
        .collect();
    tags.sort_unstable_by(|a, b| b.cmp(a));

    for tag in tags {
        if let Some(entry) = state.unacked.remove(&tag) {
            if let Some(q) = state.queues.get_mut(&entry.queue) {
                q.push_front(StoredMessage {
                    redelivered: true,
                    ..entry.message
                });
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, url: &str) -> BusResult<Arc<dyn BrokerConnection>> {
        let (id, events) = {
            let mut state = self.state();
            state.connect_attempts += 1;

            if state.unavailable {
                return Err(BusError::ConnectionError(format!(
                    "connection refused: {}",
                    url
                )));
            }

            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(BusError::ConnectionError(format!(
                    "connection refused: {}",
                    url
                )));
            }

            state.next_id += 1;
            let id = state.next_id;
            let (events, _) = broadcast::channel(16);
            state.connections.insert(
                id,
                ConnectionSlot {
                    open: true,
                    events: events.clone(),
                },
            );
            (id, events)
        };

        debug!(connection_id = id, "InMemoryBroker: connection opened");

        Ok(Arc::new(InMemoryConnection {
            broker: self.clone(),
            id,
            events,
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    events: broadcast::Sender<ConnectionEvent>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn channel(&self) -> BusResult<Arc<dyn BrokerChannel>> {
        if !self.broker.connection_open(self.id) {
            return Err(BusError::ChannelError("connection is closed".to_string()));
        }

        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
            channel_id: self.broker.next_id(),
            open: Arc::new(AtomicBool::new(true)),
            prefetch: AtomicU16::new(0),
        }))
    }

    fn events(&self) -> BoxStream<'static, ConnectionEvent> {
        let mut receiver = self.events.subscribe();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        stream.boxed()
    }

    fn is_connected(&self) -> bool {
        self.broker.connection_open(self.id)
    }

    async fn close(&self) -> BusResult<()> {
        self.broker.close_connection(self.id, "closed by client");
        Ok(())
    }
}

struct InMemoryChannel {
    broker: InMemoryBroker,
    connection_id: u64,
    channel_id: u64,
    open: Arc<AtomicBool>,
    prefetch: AtomicU16,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> BusResult<()> {
        if self.open.load(Ordering::SeqCst) && self.broker.connection_open(self.connection_id) {
            Ok(())
        } else {
            Err(BusError::ChannelError("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BusResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();

        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BusError::TopologyError(format!(
                "PRECONDITION_FAILED - exchange '{}' already declared as {}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> BusResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();

        if state.failing_queues.contains(name) {
            return Err(BusError::TopologyError(format!(
                "PRECONDITION_FAILED - cannot declare queue '{}'",
                name
            )));
        }

        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();

        if !state.queues.contains_key(queue) {
            return Err(BusError::TopologyError(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::TopologyError(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BusResult<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> BusResult<DeliveryStream> {
        self.ensure_open()?;

        if !self.broker.has_queue(queue) {
            return Err(BusError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue)));
        }

        let consumer_id = self.broker.next_id();
        debug!(queue, consumer_tag, consumer_id, "InMemoryBroker: consumer registered");

        let broker = self.broker.clone();
        let queue = queue.to_string();
        let connection_id = self.connection_id;
        let channel_id = self.channel_id;
        let open = self.open.clone();
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let acker: Arc<dyn Acknowledger> = Arc::new(InMemoryAcker {
            broker: broker.clone(),
            connection_id,
            channel_open: open.clone(),
        });

        let stream = async_stream::stream! {
            loop {
                // Register interest before looking at the queue so a publish
                // between the check and the await is not missed
                let notified = broker.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match broker.take_next(&queue, connection_id, channel_id, consumer_id, &open, prefetch, no_ack) {
                    Take::Ready(tag, message) => {
                        yield Ok(Delivery::new(
                            tag,
                            message.routing_key,
                            message.redelivered,
                            message.payload,
                            acker.clone(),
                        ));
                    }
                    Take::Empty => notified.await,
                    Take::Closed => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> BusResult<()> {
        self.ensure_open()?;
        self.broker.route(exchange, routing_key, payload.to_vec())
    }

    async fn close(&self) -> BusResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.close_channel(self.channel_id);
        }
        Ok(())
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    connection_id: u64,
    channel_open: Arc<AtomicBool>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> BusResult<()> {
        self.broker
            .settle(delivery_tag, self.connection_id, &self.channel_open, false)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BusResult<()> {
        self.broker
            .settle(delivery_tag, self.connection_id, &self.channel_open, requeue)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BusResult<()> {
        self.nack(delivery_tag, requeue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn open_channel(broker: &InMemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect("memory://").await.unwrap();
        connection.channel().await.unwrap()
    }

    async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended")
            .expect("delivery error")
    }

    #[tokio::test]
    async fn test_direct_exchange_routing() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;

        channel.declare_exchange("ex", ExchangeKind::Direct).await.unwrap();
        channel.declare_queue("a").await.unwrap();
        channel.declare_queue("b").await.unwrap();
        channel.bind_queue("a", "ex", "key.a").await.unwrap();
        channel.bind_queue("b", "ex", "key.b").await.unwrap();

        channel.publish("ex", "key.a", b"one").await.unwrap();
        channel.publish("ex", "key.unbound", b"dropped").await.unwrap();

        assert_eq!(broker.queue_depth("a"), 1);
        assert_eq!(broker.queue_depth("b"), 0);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_fails() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;

        let result = channel.publish("missing", "key", b"x").await;
        assert!(matches!(result, Err(BusError::PublishError(_))));
    }

    #[tokio::test]
    async fn test_redeclaring_exchange_with_other_kind_fails() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;

        channel.declare_exchange("ex", ExchangeKind::Direct).await.unwrap();
        assert!(channel.declare_exchange("ex", ExchangeKind::Direct).await.is_ok());
        assert!(channel.declare_exchange("ex", ExchangeKind::Topic).await.is_err());
    }

    #[tokio::test]
    async fn test_consume_and_ack() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue("jobs").await.unwrap();

        broker.enqueue("jobs", b"first".to_vec()).unwrap();
        let mut stream = channel.consume("jobs", "t", false).await.unwrap();

        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.payload, b"first");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked(), 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked(), 0);
        assert_eq!(broker.queue_depth("jobs"), 0);

        // Double ack is an error
        assert!(delivery.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_message_published_after_consume_is_delivered() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue("jobs").await.unwrap();

        let mut stream = channel.consume("jobs", "t", false).await.unwrap();
        broker.enqueue("jobs", b"late".to_vec()).unwrap();

        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue("jobs").await.unwrap();
        broker.enqueue("jobs", b"retry-me".to_vec()).unwrap();

        let mut stream = channel.consume("jobs", "t", false).await.unwrap();
        let first = next_delivery(&mut stream).await;
        first.nack(true).await.unwrap();

        let second = next_delivery(&mut stream).await;
        assert_eq!(second.payload, b"retry-me");
        assert!(second.redelivered);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_discards() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue("jobs").await.unwrap();
        broker.enqueue("jobs", b"poison".to_vec()).unwrap();

        let mut stream = channel.consume("jobs", "t", false).await.unwrap();
        let delivery = next_delivery(&mut stream).await;
        delivery.reject(false).await.unwrap();

        assert_eq!(broker.queue_depth("jobs"), 0);
        assert_eq!(broker.unacked(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue("jobs").await.unwrap();
        channel.set_prefetch(2).await.unwrap();

        for i in 0..5 {
            broker.enqueue("jobs", format!("m{}", i).into_bytes()).unwrap();
        }

        let mut stream = channel.consume("jobs", "t", false).await.unwrap();
        let first = next_delivery(&mut stream).await;
        let _second = next_delivery(&mut stream).await;

        // Third delivery is held back until something is acked
        let blocked = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(blocked.is_err(), "prefetch should block the third delivery");
        assert_eq!(broker.unacked(), 2);

        first.ack().await.unwrap();
        let third = next_delivery(&mut stream).await;
        assert_eq!(third.payload, b"m2");
    }

    #[tokio::test]
    async fn test_connection_close_requeues_unacked_and_ends_stream() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect("memory://").await.unwrap();
        let channel = connection.channel().await.unwrap();
        channel.declare_queue("jobs").await.unwrap();
        broker.enqueue("jobs", b"in-flight".to_vec()).unwrap();

        let mut events = connection.events();
        let mut stream = channel.consume("jobs", "t", false).await.unwrap();
        let delivery = next_delivery(&mut stream).await;

        broker.close_all_connections("broker restart");

        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ConnectionEvent::Closed("broker restart".to_string()));
        assert!(!connection.is_connected());

        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());

        // The unacked delivery is back on the queue and can no longer be acked
        assert_eq!(broker.queue_depth("jobs"), 1);
        assert!(delivery.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);

        assert!(broker.connect("memory://").await.is_err());
        assert!(broker.connect("memory://").await.is_err());
        assert!(broker.connect("memory://").await.is_ok());

        broker.set_unavailable(true);
        assert!(broker.connect("memory://").await.is_err());
        assert_eq!(broker.connect_attempts(), 4);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_connection_error_does_not_close() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect("memory://").await.unwrap();
        let mut events = connection.events();

        broker.emit_connection_error("heartbeat missed");

        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ConnectionEvent::Error("heartbeat missed".to_string()));
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_auto_ack_consumer() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue("jobs").await.unwrap();
        broker.enqueue("jobs", b"fire-and-forget".to_vec()).unwrap();

        let mut stream = channel.consume("jobs", "t", true).await.unwrap();
        let delivery = next_delivery(&mut stream).await;

        assert_eq!(delivery.payload, b"fire-and-forget");
        assert_eq!(broker.unacked(), 0);
        assert_eq!(broker.queue_depth("jobs"), 0);
    }
}
