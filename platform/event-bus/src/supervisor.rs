//! Connection/channel supervision
//!
//! A [`ConnectionSupervisor`] owns at most one live connection and one channel
//! for a single consumer. It declares the consumer's topology on every
//! (re)connect and drives the bounded reconnect loop. What happens once a
//! session is re-established is up to the caller (see
//! [`ConnectionSupervisor::reconnect_with`]).

use futures::stream::BoxStream;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{error, info, warn};

use crate::config::AckMode;
use crate::topology::declare_topology;
use crate::{
    Broker, BrokerChannel, BrokerConnection, BusError, BusResult, ConnectionEvent, ConsumerConfig,
};

/// Lifecycle of a supervised connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Consuming,
    /// Reconnect attempts exhausted. Only a manual start leaves this state.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Consuming => "consuming",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A freshly established connection, ready to consume on
pub struct Session {
    pub channel: Arc<dyn BrokerChannel>,
    /// Error/close notifications of the underlying connection
    pub events: BoxStream<'static, ConnectionEvent>,
}

struct Handles {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl Handles {
    async fn close(self, consumer: &str) -> BusResult<()> {
        if let Err(e) = self.channel.close().await {
            warn!(consumer, error = %e, "Failed to close channel");
        }
        self.connection.close().await
    }
}

pub struct ConnectionSupervisor {
    broker: Arc<dyn Broker>,
    url: String,
    config: ConsumerConfig,
    handles: Mutex<Option<Handles>>,
    state: watch::Sender<ConnectionState>,
    stopping: AtomicBool,
    stop_notify: Notify,
    attempts: AtomicU32,
}

impl ConnectionSupervisor {
    pub fn new(broker: Arc<dyn Broker>, url: impl Into<String>, config: ConsumerConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            broker,
            url: url.into(),
            config,
            handles: Mutex::new(None),
            state,
            stopping: AtomicBool::new(false),
            stop_notify: Notify::new(),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Consecutive failed reconnect attempts since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Flag the supervisor as stopping and wake everything waiting on [`Self::stopped`]
    pub fn begin_shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    /// Resolves once shutdown has begun
    pub async fn stopped(&self) {
        loop {
            let notified = self.stop_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_stopping() {
                return;
            }
            notified.await;
        }
    }

    pub fn mark_consuming(&self) {
        self.set_state(ConnectionState::Consuming);
    }

    /// Record that the connection was lost. Handles are released on the next
    /// connect or on [`Self::disconnect`].
    pub fn mark_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    /// Clear the stopping flag and the attempt counter ahead of a manual connect
    pub fn reset(&self) {
        self.stopping.store(false, Ordering::SeqCst);
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Manual connect
    ///
    /// Abandoned with [`BusError::ShuttingDown`] as soon as shutdown begins,
    /// including while the broker is still being dialled. Call [`Self::reset`]
    /// first to connect again after a [`Self::disconnect`].
    pub async fn connect(&self) -> BusResult<Session> {
        self.config.validate()?;

        tokio::select! {
            session = self.establish() => session,
            _ = self.stopped() => {
                self.set_state(ConnectionState::Disconnected);
                Err(BusError::ShuttingDown)
            }
        }
    }

    /// Close channel then connection. Safe to call repeatedly.
    pub async fn disconnect(&self) -> BusResult<()> {
        self.begin_shutdown();

        let handles = self.handles.lock().await.take();
        let result = match handles {
            Some(handles) => {
                let result = handles.close(&self.config.name).await;
                info!(consumer = %self.config.name, "Disconnected from broker");
                result
            }
            None => Ok(()),
        };

        self.set_state(ConnectionState::Disconnected);
        result
    }

    /// Reconnect loop
    ///
    /// Waits the policy delay before each attempt, establishes a session and
    /// hands it to `resume`. The attempt counter resets once `resume` succeeds.
    /// Returns `None` when shutdown begins or the attempt ceiling is reached,
    /// the latter leaving the supervisor in [`ConnectionState::Failed`].
    pub async fn reconnect_with<T, F, Fut>(&self, mut resume: F) -> Option<T>
    where
        F: FnMut(Session) -> Fut,
        Fut: Future<Output = BusResult<T>>,
    {
        let policy = &self.config.reconnect;

        loop {
            if self.is_stopping() {
                return None;
            }

            let attempt = self.reconnect_attempts() + 1;
            let Some(delay) = policy.delay_for(attempt) else {
                error!(
                    consumer = %self.config.name,
                    queue = %self.config.queue,
                    max_attempts = policy.max_attempts,
                    "Reconnect attempts exhausted, consumer is down"
                );
                self.set_state(ConnectionState::Failed);
                return None;
            };

            info!(
                consumer = %self.config.name,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stopped() => return None,
            }

            if self.is_stopping() {
                return None;
            }

            let established = tokio::select! {
                established = self.establish() => established,
                _ = self.stopped() => return None,
            };

            let result = match established {
                Ok(session) if self.is_stopping() => {
                    drop(session);
                    self.close_handles().await;
                    return None;
                }
                Ok(session) => resume(session).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    info!(consumer = %self.config.name, attempt, "Reconnected to broker");
                    return Some(value);
                }
                Err(e) => {
                    self.attempts.store(attempt, Ordering::SeqCst);
                    self.set_state(ConnectionState::Disconnected);
                    warn!(
                        consumer = %self.config.name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
            }
        }
    }

    async fn establish(&self) -> BusResult<Session> {
        self.set_state(ConnectionState::Connecting);

        // The handles lock is never held across the broker round-trip
        self.release_stale().await;

        info!(
            consumer = %self.config.name,
            url = %redact_url(&self.url),
            "Connecting to broker"
        );

        let connection = match self.broker.connect(&self.url).await {
            Ok(connection) => connection,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        // Subscribe before anything else so an early close is not missed
        let events = connection.events();

        match self.open_channel(connection.as_ref()).await {
            Ok(channel) => {
                let replaced = self.handles.lock().await.replace(Handles {
                    connection,
                    channel: channel.clone(),
                });
                if let Some(stale) = replaced {
                    self.close_logged(stale).await;
                }
                self.set_state(ConnectionState::Connected);
                info!(
                    consumer = %self.config.name,
                    queue = %self.config.queue,
                    prefetch = self.config.prefetch,
                    "Connected to broker"
                );
                Ok(Session { channel, events })
            }
            Err(e) => {
                if let Err(close_error) = connection.close().await {
                    warn!(
                        consumer = %self.config.name,
                        error = %close_error,
                        "Failed to close connection after channel setup failed"
                    );
                }
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open_channel(&self, connection: &dyn BrokerConnection) -> BusResult<Arc<dyn BrokerChannel>> {
        let channel = connection.channel().await?;
        declare_topology(channel.as_ref(), &self.config).await?;

        if self.config.ack_mode == AckMode::Manual {
            channel.set_prefetch(self.config.prefetch).await?;
        }

        Ok(channel)
    }

    async fn close_handles(&self) {
        self.release_stale().await;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn release_stale(&self) {
        let stale = self.handles.lock().await.take();
        if let Some(stale) = stale {
            self.close_logged(stale).await;
        }
    }

    async fn close_logged(&self, handles: Handles) {
        if let Err(e) = handles.close(&self.config.name).await {
            warn!(consumer = %self.config.name, error = %e, "Failed to close connection");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

/// Strip credentials from a broker URL before logging it
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
