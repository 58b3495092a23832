//! # Broker Abstraction
//!
//! Platform-level plumbing for consuming events from an AMQP-style broker
//! (exchange → binding → queue).
//!
//! ## Layers
//!
//! - [`Broker`] / [`BrokerConnection`] / [`BrokerChannel`]: the narrow
//!   interface every broker client is adapted to. The supervisor only ever
//!   talks to these traits.
//! - [`AmqpBroker`]: production implementation over `lapin` (RabbitMQ)
//! - [`InMemoryBroker`]: test/dev implementation with fault injection
//! - [`ConnectionSupervisor`]: owns one connection + channel, declares
//!   topology and drives the reconnect loop using a [`ReconnectPolicy`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{Broker, ConnectionSupervisor, ConsumerConfig, ExchangeKind, InMemoryBroker};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
//! let config = ConsumerConfig::new("notifications", "notificaciones_queue")
//!     .with_exchange("lista_compra_exchange", ExchangeKind::Direct, "notificaciones")
//!     .with_dead_letter_queue("notificaciones_dlq");
//!
//! let supervisor = ConnectionSupervisor::new(broker, "amqp://localhost:5672", config);
//! let session = supervisor.connect().await?;
//! let _deliveries = session.channel.consume("notificaciones_queue", "tag", false).await?;
//! supervisor.disconnect().await?;
//! # Ok(())
//! # }
//! ```

mod amqp_broker;
mod config;
mod envelope;
mod inmemory_broker;
mod publisher;
mod reconnect;
mod supervisor;
mod topology;

pub use amqp_broker::AmqpBroker;
pub use config::{AckMode, ConsumerConfig, ExchangeBinding, DEFAULT_PREFETCH};
pub use envelope::{validate_envelope_fields, EventEnvelope};
pub use inmemory_broker::InMemoryBroker;
pub use publisher::EventPublisher;
pub use reconnect::{Backoff, ReconnectPolicy};
pub use supervisor::{ConnectionState, ConnectionSupervisor, Session};
pub use topology::declare_topology;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Errors that can occur when talking to the broker
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("topology declaration failed: {0}")]
    TopologyError(String),

    #[error("failed to start consuming: {0}")]
    ConsumeError(String),

    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("acknowledgment failed: {0}")]
    AckError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid consumer configuration: {0}")]
    InvalidConfig(String),

    #[error("shutdown in progress")]
    ShuttingDown,
}

/// Result type for broker operations
pub type BusResult<T> = Result<T, BusError>;

/// AMQP exchange type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(name)
    }
}

impl FromStr for ExchangeKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            "fanout" => Ok(ExchangeKind::Fanout),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(BusError::InvalidConfig(format!(
                "unknown exchange type '{}'",
                other
            ))),
        }
    }
}

/// Out-of-band notification from a live connection
///
/// `Error` is informational only. `Closed` means the connection is gone and
/// is what drives reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Error(String),
    Closed(String),
}

/// Settles a delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> BusResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BusResult<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BusResult<()>;
}

/// A message handed to a consumer, together with the handle to settle it
pub struct Delivery {
    /// Channel-scoped tag used when acknowledging
    pub delivery_tag: u64,
    /// Routing key the message was published with
    pub routing_key: String,
    /// True if the broker delivered this message before (after a requeue)
    pub redelivered: bool,
    /// Raw message body
    pub payload: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: String,
        redelivered: bool,
        payload: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key,
            redelivered,
            payload,
            acker,
        }
    }

    pub async fn ack(&self) -> BusResult<()> {
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn nack(&self, requeue: bool) -> BusResult<()> {
        self.acker.nack(self.delivery_tag, requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> BusResult<()> {
        self.acker.reject(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Stream of deliveries returned by [`BrokerChannel::consume`]
pub type DeliveryStream = BoxStream<'static, BusResult<Delivery>>;

/// Entry point of a broker client: opens connections
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new physical connection to the broker at `url`
    async fn connect(&self, url: &str) -> BusResult<Arc<dyn BrokerConnection>>;
}

/// A physical broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a logical channel on this connection
    async fn channel(&self) -> BusResult<Arc<dyn BrokerChannel>>;

    /// Subscribe to error/close notifications for this connection
    fn events(&self) -> BoxStream<'static, ConnectionEvent>;

    fn is_connected(&self) -> bool;

    /// Close the connection. Closing an already closed connection is not an error.
    async fn close(&self) -> BusResult<()>;
}

/// A logical channel: topology, consumption and publishing
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable exchange
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BusResult<()>;

    /// Declare a durable queue
    async fn declare_queue(&self, name: &str) -> BusResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()>;

    /// Limit unacknowledged deliveries in flight for consumers on this channel
    async fn set_prefetch(&self, count: u16) -> BusResult<()>;

    /// Start a consumer on `queue`. With `no_ack` the broker settles
    /// deliveries itself and acknowledgments must not be sent.
    async fn consume(&self, queue: &str, consumer_tag: &str, no_ack: bool)
        -> BusResult<DeliveryStream>;

    /// Publish a message. An empty `exchange` is the default exchange, which
    /// routes directly to the queue named by `routing_key`.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> BusResult<()>;

    async fn close(&self) -> BusResult<()>;
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_from_str() {
        assert_eq!("direct".parse::<ExchangeKind>().unwrap(), ExchangeKind::Direct);
        assert_eq!(" Topic ".parse::<ExchangeKind>().unwrap(), ExchangeKind::Topic);
        assert_eq!("FANOUT".parse::<ExchangeKind>().unwrap(), ExchangeKind::Fanout);
        assert!("x-delayed".parse::<ExchangeKind>().is_err());
    }

    #[test]
    fn test_exchange_kind_display_round_trips() {
        for kind in [
            ExchangeKind::Direct,
            ExchangeKind::Topic,
            ExchangeKind::Fanout,
            ExchangeKind::Headers,
        ] {
            assert_eq!(kind.to_string().parse::<ExchangeKind>().unwrap(), kind);
        }
    }
}
