use async_trait::async_trait;
use event_bus::Delivery;

/// Failure reported by a [`MessageHandler`]
///
/// The consumer is the only place that turns this into ack/nack/dead-letter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Retrying the same message can never succeed (bad payload, missing entity)
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The message may succeed on redelivery (repository or network hiccup)
    #[error("transient failure: {0}")]
    Transient(String),
}

impl HandlerError {
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Processes one decoded message
///
/// `message` is the JSON-decoded body. `delivery` is passed for metadata
/// (routing key, redelivered flag); the handler must not settle it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &serde_json::Value, delivery: &Delivery) -> Result<(), HandlerError>;
}
