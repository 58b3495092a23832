//! Resilient consumer
//!
//! One [`ResilientConsumer`] consumes one queue through a
//! [`ConnectionSupervisor`]. Deliveries are processed concurrently up to the
//! prefetch limit. Each outcome is settled with the broker:
//!
//! | handler outcome | DLQ configured           | no DLQ                    |
//! |-----------------|--------------------------|---------------------------|
//! | success         | ack                      | ack                       |
//! | transient error | publish to DLQ, then ack | nack, requeue             |
//! | permanent error | publish to DLQ, then ack | reject, no requeue        |
//!
//! Undecodable bodies count as permanent errors. If the DLQ publish fails the
//! message is requeued so it is never lost.

use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use event_bus::{
    AckMode, Broker, BrokerChannel, BusError, BusResult, ConnectionEvent, ConnectionState,
    ConnectionSupervisor, ConsumerConfig, Delivery, DeliveryStream, Session,
};

use crate::handler::{HandlerError, MessageHandler};

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("consumer task failed: {0}")]
    Task(String),

    #[error("consumer stopped before consumption began")]
    Stopped,
}

/// Snapshot of per-consumer delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerCounters {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
}

#[derive(Default)]
struct ConsumerMetrics {
    received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    discarded: AtomicU64,
}

impl ConsumerMetrics {
    fn snapshot(&self) -> ConsumerCounters {
        ConsumerCounters {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Status of one consumer as reported by the worker manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStatus {
    pub name: String,
    pub queue: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub counters: ConsumerCounters,
}

enum LoopExit {
    Stopped,
    ConnectionLost(String),
}

struct Inner {
    supervisor: ConnectionSupervisor,
    handler: Arc<dyn MessageHandler>,
    metrics: ConsumerMetrics,
}

enum Task {
    Idle,
    /// A start is connecting without holding the task lock
    Starting(u64),
    Running(JoinHandle<()>),
}

pub struct ResilientConsumer {
    inner: Arc<Inner>,
    task: Mutex<Task>,
    starts: AtomicU64,
}

impl ResilientConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        url: impl Into<String>,
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                supervisor: ConnectionSupervisor::new(broker, url, config),
                handler,
                metrics: ConsumerMetrics::default(),
            }),
            task: Mutex::new(Task::Idle),
            starts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config().name
    }

    pub fn queue(&self) -> &str {
        &self.inner.config().queue
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.supervisor.subscribe_state()
    }

    /// Connect, declare topology and start the consumption loop
    ///
    /// Returns once consumption has begun. Calling it while the loop is
    /// running (or another start is connecting) is a no-op. Calling it after
    /// the consumer gave up ([`ConnectionState::Failed`]) starts over with a
    /// fresh attempt budget. A concurrent [`Self::stop`] abandons the start
    /// with [`ConsumerError::Stopped`].
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let start_id = self.starts.fetch_add(1, Ordering::SeqCst);
        {
            let mut task = self.task.lock().await;
            match std::mem::replace(&mut *task, Task::Idle) {
                Task::Starting(id) => {
                    *task = Task::Starting(id);
                    debug!(consumer = %self.name(), "Consumer already starting");
                    return Ok(());
                }
                Task::Running(handle) if !handle.is_finished() && self.state() != ConnectionState::Failed => {
                    *task = Task::Running(handle);
                    debug!(consumer = %self.name(), "Consumer already running");
                    return Ok(());
                }
                Task::Running(handle) => {
                    // Loop has given up and is exiting
                    if let Err(e) = handle.await {
                        warn!(consumer = %self.name(), error = %e, "Previous consumption loop panicked");
                    }
                }
                Task::Idle => {}
            }

            self.inner.supervisor.reset();
            *task = Task::Starting(start_id);
        }

        let started = self.connect_and_consume().await;

        let mut task = self.task.lock().await;
        if !matches!(*task, Task::Starting(id) if id == start_id) || self.inner.supervisor.is_stopping() {
            // Stopped while connecting
            drop(task);
            self.disconnect_quietly().await;
            return Err(ConsumerError::Stopped);
        }

        let (session, deliveries) = match started {
            Ok(started) => started,
            Err(e) => {
                *task = Task::Idle;
                drop(task);
                self.disconnect_quietly().await;
                return Err(e.into());
            }
        };

        info!(
            consumer = %self.name(),
            queue = %self.queue(),
            "Consumer started"
        );

        let inner = self.inner.clone();
        *task = Task::Running(tokio::spawn(inner.run(
            session.channel,
            session.events,
            deliveries,
        )));
        Ok(())
    }

    /// Stop consuming, let in-flight messages settle, then close the connection
    ///
    /// Suppresses any further reconnect and abandons a start that is still
    /// connecting. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        let handle = {
            let mut task = self.task.lock().await;
            self.inner.supervisor.begin_shutdown();
            match std::mem::replace(&mut *task, Task::Idle) {
                Task::Running(handle) => Some(handle),
                Task::Starting(_) | Task::Idle => None,
            }
        };

        let joined = match handle {
            Some(handle) => handle.await.map_err(|e| ConsumerError::Task(e.to_string())),
            None => Ok(()),
        };

        self.inner.supervisor.disconnect().await?;
        joined?;

        info!(consumer = %self.name(), "Consumer stopped");
        Ok(())
    }

    async fn connect_and_consume(&self) -> BusResult<(Session, DeliveryStream)> {
        let session = self.inner.supervisor.connect().await?;
        let deliveries = self.inner.begin_consuming(&session.channel).await?;
        Ok((session, deliveries))
    }

    async fn disconnect_quietly(&self) {
        if let Err(e) = self.inner.supervisor.disconnect().await {
            warn!(consumer = %self.name(), error = %e, "Failed to disconnect after aborted start");
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        let state = self.inner.supervisor.state();
        ConsumerStatus {
            name: self.name().to_string(),
            queue: self.queue().to_string(),
            state,
            connected: matches!(state, ConnectionState::Connected | ConnectionState::Consuming),
            reconnect_attempts: self.inner.supervisor.reconnect_attempts(),
            counters: self.inner.metrics.snapshot(),
        }
    }
}

impl Inner {
    fn config(&self) -> &ConsumerConfig {
        self.supervisor.config()
    }

    async fn begin_consuming(&self, channel: &Arc<dyn BrokerChannel>) -> BusResult<DeliveryStream> {
        let config = self.config();
        let deliveries = channel
            .consume(
                &config.queue,
                &config.consumer_tag(),
                config.ack_mode == AckMode::Auto,
            )
            .await?;

        self.supervisor.mark_consuming();
        Ok(deliveries)
    }

    async fn run(
        self: Arc<Self>,
        mut channel: Arc<dyn BrokerChannel>,
        mut events: BoxStream<'static, ConnectionEvent>,
        mut deliveries: DeliveryStream,
    ) {
        let mut in_flight = JoinSet::new();

        loop {
            let exit = self
                .consume_until_exit(&channel, &mut events, &mut deliveries, &mut in_flight)
                .await;

            // In-flight handlers settle on the channel they were delivered on
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    error!(consumer = %self.config().name, error = %e, "Message task panicked");
                }
            }

            let reason = match exit {
                LoopExit::Stopped => break,
                LoopExit::ConnectionLost(reason) => reason,
            };

            self.supervisor.mark_disconnected();
            warn!(
                consumer = %self.config().name,
                queue = %self.config().queue,
                reason = %reason,
                "Broker connection lost"
            );

            let inner = self.clone();
            let resumed = self
                .supervisor
                .reconnect_with(move |session| {
                    let inner = inner.clone();
                    async move {
                        let deliveries = inner.begin_consuming(&session.channel).await;
                        deliveries.map(|deliveries| (session, deliveries))
                    }
                })
                .await;

            match resumed {
                Some((session, resumed_deliveries)) => {
                    channel = session.channel;
                    events = session.events;
                    deliveries = resumed_deliveries;
                }
                None => break,
            }
        }

        debug!(consumer = %self.config().name, "Consumption loop exited");
    }

    async fn consume_until_exit(
        self: &Arc<Self>,
        channel: &Arc<dyn BrokerChannel>,
        events: &mut BoxStream<'static, ConnectionEvent>,
        deliveries: &mut DeliveryStream,
        in_flight: &mut JoinSet<()>,
    ) -> LoopExit {
        let config = self.config();
        let limit = usize::from(config.prefetch.max(1));

        loop {
            tokio::select! {
                biased;

                _ = self.supervisor.stopped() => return LoopExit::Stopped,

                event = events.next() => match event {
                    // Informational only; a close follows if the connection is gone
                    Some(ConnectionEvent::Error(reason)) => {
                        error!(consumer = %config.name, error = %reason, "Broker connection error");
                    }
                    Some(ConnectionEvent::Closed(reason)) => return LoopExit::ConnectionLost(reason),
                    None => return LoopExit::ConnectionLost("connection event stream ended".to_string()),
                },

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(consumer = %config.name, error = %e, "Message task panicked");
                    }
                }

                delivery = deliveries.next(), if in_flight.len() < limit => match delivery {
                    Some(Ok(delivery)) => {
                        let span = info_span!(
                            "consume",
                            consumer = %config.name,
                            queue = %config.queue,
                            delivery_tag = delivery.delivery_tag,
                            redelivered = delivery.redelivered,
                        );
                        let inner = self.clone();
                        let channel = channel.clone();
                        in_flight.spawn(async move { inner.process(channel, delivery).await }.instrument(span));
                    }
                    Some(Err(e)) => return LoopExit::ConnectionLost(e.to_string()),
                    None => return LoopExit::ConnectionLost("consumer cancelled by broker".to_string()),
                },
            }
        }
    }

    async fn process(&self, channel: Arc<dyn BrokerChannel>, delivery: Delivery) {
        ConsumerMetrics::incr(&self.metrics.received);

        let outcome = match decode(&delivery.payload) {
            Ok(message) => self.handler.handle(&message, &delivery).await,
            Err(e) => Err(e),
        };

        if self.config().ack_mode == AckMode::Auto {
            // Already settled by the broker; nothing can be retried
            match outcome {
                Ok(()) => ConsumerMetrics::incr(&self.metrics.acked),
                Err(e) => {
                    ConsumerMetrics::incr(&self.metrics.discarded);
                    error!(error = %e, "Message handling failed with auto-ack, message lost");
                }
            }
            return;
        }

        match outcome {
            Ok(()) => match delivery.ack().await {
                Ok(()) => {
                    ConsumerMetrics::incr(&self.metrics.acked);
                    debug!("Message acknowledged");
                }
                Err(e) => error!(error = %e, "Failed to acknowledge message"),
            },
            Err(e) => self.settle_failure(channel.as_ref(), &delivery, e).await,
        }
    }

    async fn settle_failure(&self, channel: &dyn BrokerChannel, delivery: &Delivery, failure: HandlerError) {
        if let Some(dlq) = &self.config().dead_letter_queue {
            if let Err(e) = channel.publish("", dlq, &delivery.payload).await {
                error!(
                    dlq = %dlq,
                    error = %e,
                    handler_error = %failure,
                    "Failed to publish to dead-letter queue, requeueing"
                );
                self.requeue(delivery).await;
                return;
            }

            match delivery.ack().await {
                Ok(()) => {
                    ConsumerMetrics::incr(&self.metrics.dead_lettered);
                    error!(dlq = %dlq, error = %failure, "Message moved to dead-letter queue");
                }
                Err(e) => error!(
                    dlq = %dlq,
                    error = %e,
                    "Dead-lettered message could not be acknowledged and may be redelivered"
                ),
            }
            return;
        }

        if failure.is_permanent() {
            match delivery.reject(false).await {
                Ok(()) => {
                    ConsumerMetrics::incr(&self.metrics.discarded);
                    error!(error = %failure, "Message rejected without requeue (no dead-letter queue configured)");
                }
                Err(e) => error!(error = %e, "Failed to reject message"),
            }
        } else {
            warn!(error = %failure, "Message handling failed, requeueing");
            self.requeue(delivery).await;
        }
    }

    async fn requeue(&self, delivery: &Delivery) {
        match delivery.nack(true).await {
            Ok(()) => ConsumerMetrics::incr(&self.metrics.requeued),
            Err(e) => error!(error = %e, "Failed to requeue message"),
        }
    }
}

/// Decode a message body as UTF-8 JSON
fn decode(payload: &[u8]) -> Result<serde_json::Value, HandlerError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| HandlerError::permanent(format!("body is not valid UTF-8: {}", e)))?;

    serde_json::from_str(text)
        .map_err(|e| HandlerError::permanent(format!("body is not valid JSON: {}", e)))
}
