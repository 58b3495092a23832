use tracing::debug;

use crate::{BrokerChannel, BusResult, ConsumerConfig};

/// Declare everything a consumer needs before it can consume
///
/// Idempotent: runs on every (re)connect. Order matters, the queue must exist
/// before it is bound.
///
/// 1. exchange (durable), when configured
/// 2. queue (durable)
/// 3. binding queue → exchange with the routing key
/// 4. dead-letter queue (durable), when configured
pub async fn declare_topology(channel: &dyn BrokerChannel, config: &ConsumerConfig) -> BusResult<()> {
    if let Some(exchange) = &config.exchange {
        channel.declare_exchange(&exchange.name, exchange.kind).await?;
        debug!(exchange = %exchange.name, kind = %exchange.kind, "Exchange asserted");
    }

    channel.declare_queue(&config.queue).await?;
    debug!(queue = %config.queue, "Queue asserted");

    if let Some(exchange) = &config.exchange {
        channel
            .bind_queue(&config.queue, &exchange.name, &exchange.routing_key)
            .await?;
        debug!(
            queue = %config.queue,
            exchange = %exchange.name,
            routing_key = %exchange.routing_key,
            "Queue bound"
        );
    }

    if let Some(dlq) = &config.dead_letter_queue {
        channel.declare_queue(dlq).await?;
        debug!(queue = %dlq, "Dead-letter queue asserted");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Broker, ExchangeKind, InMemoryBroker};

    #[tokio::test]
    async fn test_declares_exchange_queue_binding_and_dlq() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect("memory://").await.unwrap();
        let channel = connection.channel().await.unwrap();

        let config = ConsumerConfig::new("notifications", "notificaciones_queue")
            .with_exchange("lista_compra_exchange", ExchangeKind::Direct, "notificaciones")
            .with_dead_letter_queue("notificaciones_dlq");

        declare_topology(channel.as_ref(), &config).await.unwrap();

        assert!(broker.has_exchange("lista_compra_exchange"));
        assert!(broker.has_queue("notificaciones_queue"));
        assert!(broker.has_queue("notificaciones_dlq"));
        assert!(broker.is_bound("notificaciones_queue", "lista_compra_exchange", "notificaciones"));

        // Declaring again is a no-op
        declare_topology(channel.as_ref(), &config).await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_only_topology() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect("memory://").await.unwrap();
        let channel = connection.channel().await.unwrap();

        let config = ConsumerConfig::new("plain", "plain_queue");
        declare_topology(channel.as_ref(), &config).await.unwrap();

        assert!(broker.has_queue("plain_queue"));
        assert!(!broker.has_exchange("lista_compra_exchange"));
    }

    #[tokio::test]
    async fn test_queue_declare_failure_propagates() {
        let broker = InMemoryBroker::new();
        broker.fail_queue_declare("broken_queue");
        let connection = broker.connect("memory://").await.unwrap();
        let channel = connection.channel().await.unwrap();

        let config = ConsumerConfig::new("broken", "broken_queue");
        assert!(declare_topology(channel.as_ref(), &config).await.is_err());
    }
}
