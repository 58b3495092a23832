use event_bus::{AmqpBroker, Broker, InMemoryBroker};
use event_consumer::{ConsumerDefinition, ManagerError, WorkerManager};
use std::sync::Arc;

use crate::config::{BrokerType, Config};
use crate::handlers::NotificationHandler;

/// Broker implementation selected by `BROKER_TYPE`
pub fn build_broker(broker_type: BrokerType) -> Arc<dyn Broker> {
    match broker_type {
        BrokerType::Amqp => {
            tracing::info!("Using AMQP broker");
            Arc::new(AmqpBroker::new())
        }
        BrokerType::InMemory => {
            tracing::info!("Using in-memory broker");
            Arc::new(InMemoryBroker::new())
        }
    }
}

/// Consumer for the notifications queue
pub fn notification_consumer(config: &Config, handler: Arc<NotificationHandler>) -> ConsumerDefinition {
    ConsumerDefinition::new(config.consumer_config(), handler)
}

/// Worker manager owning every consumer this service runs
pub fn build_worker_manager(
    config: &Config,
    broker: Arc<dyn Broker>,
    handler: Arc<NotificationHandler>,
) -> Result<WorkerManager, ManagerError> {
    let consumers = vec![notification_consumer(config, handler)];

    tracing::info!(
        enabled = config.messaging_enabled,
        queue = %config.queue,
        exchange = %config.exchange,
        routing_key = %config.routing_key,
        dead_letter_queue = config.dead_letter_queue.as_deref().unwrap_or("-"),
        "Configured notification consumers"
    );

    WorkerManager::new(config.worker_settings(), broker, consumers)
}
