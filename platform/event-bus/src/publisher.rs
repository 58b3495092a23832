use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::{BrokerChannel, BusError, BusResult, EventEnvelope};

/// Publishes JSON event envelopes to one exchange
///
/// Used by producers and by tests that drive a consumer end to end.
#[derive(Clone)]
pub struct EventPublisher {
    channel: Arc<dyn BrokerChannel>,
    exchange: String,
}

impl EventPublisher {
    pub fn new(channel: Arc<dyn BrokerChannel>, exchange: impl Into<String>) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
        }
    }

    pub async fn publish<T: Serialize + Sync>(
        &self,
        routing_key: &str,
        envelope: &EventEnvelope<T>,
    ) -> BusResult<()> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| BusError::SerializationError(e.to_string()))?;

        self.channel
            .publish(&self.exchange, routing_key, &payload)
            .await?;

        debug!(
            exchange = %self.exchange,
            routing_key,
            event_type = %envelope.event_type,
            event_id = envelope.event_id_or_dash(),
            "Published event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Broker, ExchangeKind, InMemoryBroker};
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_routes_envelope_to_bound_queue() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect("memory://").await.unwrap();
        let channel = connection.channel().await.unwrap();
        channel.declare_exchange("lista_compra_exchange", ExchangeKind::Direct).await.unwrap();
        channel.declare_queue("notificaciones_queue").await.unwrap();
        channel
            .bind_queue("notificaciones_queue", "lista_compra_exchange", "notificaciones")
            .await
            .unwrap();

        let publisher = EventPublisher::new(channel.clone(), "lista_compra_exchange");
        let envelope = EventEnvelope::new("ListaActualizada", json!({"listaId": "l-1"}));
        publisher.publish("notificaciones", &envelope).await.unwrap();
        assert_eq!(broker.queue_depth("notificaciones_queue"), 1);

        let mut deliveries = channel.consume("notificaciones_queue", "t", true).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(body["eventType"], "ListaActualizada");
        assert_eq!(body["data"]["listaId"], "l-1");
    }
}
