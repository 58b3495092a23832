use std::time::Duration;

use crate::reconnect::ReconnectPolicy;
use crate::{BusError, BusResult, ExchangeKind};

/// Default number of unacknowledged deliveries per consumer
pub const DEFAULT_PREFETCH: u16 = 10;

/// Who settles deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// The consumer acks/nacks/rejects each delivery after handling it
    #[default]
    Manual,
    /// The broker considers a message settled as soon as it is delivered
    Auto,
}

/// Exchange the consumer queue is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeBinding {
    pub name: String,
    pub kind: ExchangeKind,
    pub routing_key: String,
}

/// Per-consumer configuration, immutable once the consumer is started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Unique consumer name (used by the worker manager and in logs)
    pub name: String,
    pub queue: String,
    pub exchange: Option<ExchangeBinding>,
    pub prefetch: u16,
    pub ack_mode: AckMode,
    pub reconnect: ReconnectPolicy,
    pub dead_letter_queue: Option<String>,
    pub consumer_tag: Option<String>,
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            exchange: None,
            prefetch: DEFAULT_PREFETCH,
            ack_mode: AckMode::Manual,
            reconnect: ReconnectPolicy::default(),
            dead_letter_queue: None,
            consumer_tag: None,
        }
    }

    pub fn with_exchange(
        mut self,
        name: impl Into<String>,
        kind: ExchangeKind,
        routing_key: impl Into<String>,
    ) -> Self {
        self.exchange = Some(ExchangeBinding {
            name: name.into(),
            kind,
            routing_key: routing_key.into(),
        });
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Shorthand for a fixed-delay reconnect policy
    pub fn with_reconnect(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.reconnect = ReconnectPolicy::fixed(max_attempts, delay);
        self
    }

    pub fn with_dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    /// Consumer tag sent to the broker (defaults to `<name>-consumer`)
    pub fn consumer_tag(&self) -> String {
        self.consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-consumer", self.name))
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.name.trim().is_empty() {
            return Err(BusError::InvalidConfig("consumer name cannot be empty".to_string()));
        }

        if self.queue.trim().is_empty() {
            return Err(BusError::InvalidConfig(format!(
                "consumer '{}' has an empty queue name",
                self.name
            )));
        }

        if let Some(exchange) = &self.exchange {
            if exchange.name.trim().is_empty() {
                return Err(BusError::InvalidConfig(format!(
                    "consumer '{}' has an empty exchange name",
                    self.name
                )));
            }
        }

        if let Some(dlq) = &self.dead_letter_queue {
            if dlq.trim().is_empty() || dlq == &self.queue {
                return Err(BusError::InvalidConfig(format!(
                    "consumer '{}' dead-letter queue must be non-empty and differ from its queue",
                    self.name
                )));
            }
        }

        Ok(())
    }
}
