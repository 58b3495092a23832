//! Broker to email, through the worker manager built from service config

use event_bus::{
    Broker, ConnectionState, EventEnvelope, EventPublisher, ExchangeKind, InMemoryBroker,
};
use event_consumer::{ConsumerCounters, WorkerManager};
use futures::StreamExt;
use notifications_rs::consumer_tasks::build_worker_manager;
use notifications_rs::email::LoggingEmailSender;
use notifications_rs::models::UserRegisteredPayload;
use notifications_rs::ports::{ShoppingList, User};
use notifications_rs::repositories::{InMemoryListRepository, InMemoryUserRepository};
use notifications_rs::{BrokerType, Config, NotificationHandler};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn config() -> Config {
    Config {
        messaging_enabled: true,
        broker_type: BrokerType::InMemory,
        rabbitmq_url: "memory://".to_string(),
        exchange: "lista_compra_exchange".to_string(),
        exchange_type: ExchangeKind::Direct,
        queue: "notificaciones_queue".to_string(),
        routing_key: "notificaciones".to_string(),
        dead_letter_queue: Some("notificaciones_dlq".to_string()),
        prefetch: 10,
        max_reconnect_attempts: 5,
        reconnect_delay: Duration::from_millis(50),
        host: "127.0.0.1".to_string(),
        port: 0,
    }
}

fn handler() -> Arc<NotificationHandler> {
    let users = InMemoryUserRepository::with_users([User {
        id: "U1".to_string(),
        email: "ana@example.com".to_string(),
        name: "Ana".to_string(),
    }]);
    let lists = InMemoryListRepository::with_lists([ShoppingList {
        id: "L1".to_string(),
        name: "Semana".to_string(),
        owner_id: "U1".to_string(),
        collaborator_ids: vec![],
    }]);

    Arc::new(NotificationHandler::new(
        Arc::new(users),
        Arc::new(lists),
        Arc::new(LoggingEmailSender::new()),
    ))
}

fn manager(broker: &InMemoryBroker, config: &Config) -> WorkerManager {
    build_worker_manager(config, Arc::new(broker.clone()), handler()).unwrap()
}

fn publish(broker: &InMemoryBroker, body: &Value) {
    broker
        .publish(
            "lista_compra_exchange",
            "notificaciones",
            serde_json::to_vec(body).unwrap(),
        )
        .unwrap();
}

/// Wait until the single consumer's counters satisfy `done`
async fn settled(manager: &WorkerManager, done: impl Fn(&ConsumerCounters) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = manager.status().await;
            if status.consumers.first().is_some_and(|c| done(&c.counters)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("counters not reached in time");
}

/// Take the next message off `queue` through a fresh auto-ack consumer
async fn next_body(broker: &InMemoryBroker, queue: &str) -> Vec<u8> {
    let connection = broker.connect("memory://").await.unwrap();
    let channel = connection.channel().await.unwrap();
    let mut deliveries = channel.consume(queue, "inspect", true).await.unwrap();
    let body = deliveries.next().await.unwrap().unwrap().payload;
    connection.close().await.unwrap();
    body
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn test_topology_is_declared_on_start() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, &config());

    manager.start().await.unwrap();

    assert!(broker.has_exchange("lista_compra_exchange"));
    assert!(broker.has_queue("notificaciones_queue"));
    assert!(broker.has_queue("notificaciones_dlq"));
    assert!(broker.is_bound("notificaciones_queue", "lista_compra_exchange", "notificaciones"));

    let status = manager.status().await;
    assert!(status.healthy);
    assert_eq!(status.consumers.len(), 1);
    assert_eq!(status.consumers[0].name, "notifications");
    assert_eq!(status.consumers[0].state, ConnectionState::Consuming);

    manager.stop().await;
}

#[tokio::test]
async fn test_registration_event_is_acknowledged() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, &config());
    manager.start().await.unwrap();

    publish(
        &broker,
        &json!({
            "eventType": "UsuarioRegistrado",
            "eventId": "evt-1",
            "data": {"email": "a@b.com", "nombre": "Ana", "confirmationToken": "tok1"}
        }),
    );
    settled(&manager, |c| c.acked == 1).await;

    assert_eq!(broker.queue_depth("notificaciones_queue"), 0);
    assert_eq!(broker.queue_depth("notificaciones_dlq"), 0);

    let counters = manager.status().await.consumers[0].counters;
    assert_eq!(counters.acked, 1);
    assert_eq!(counters.dead_lettered, 0);

    manager.stop().await;
}

#[tokio::test]
async fn test_unknown_sharer_lands_in_dead_letter_queue() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, &config());
    manager.start().await.unwrap();

    let event = json!({
        "eventType": "ListaCompartida",
        "eventId": "evt-2",
        "data": {
            "listaId": "L1",
            "usuarioComparteId": "U-missing",
            "emailInvitado": "bob@example.com",
            "tipoPermiso": "LECTURA",
            "tokenInvitacion": "inv-1"
        }
    });
    publish(&broker, &event);
    eventually(|| broker.queue_depth("notificaciones_dlq") == 1).await;

    settled(&manager, |c| c.dead_lettered == 1).await;
    assert_eq!(broker.unacked(), 0);
    assert_eq!(broker.queue_depth("notificaciones_queue"), 0);

    let dead: Value = serde_json::from_slice(&next_body(&broker, "notificaciones_dlq").await).unwrap();
    assert_eq!(dead, event);

    manager.stop().await;
    assert_eq!(manager.status().await.consumers.len(), 0);
}

#[tokio::test]
async fn test_garbage_body_lands_in_dead_letter_queue() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, &config());
    manager.start().await.unwrap();

    broker
        .publish("lista_compra_exchange", "notificaciones", b"{not json".to_vec())
        .unwrap();
    eventually(|| broker.queue_depth("notificaciones_dlq") == 1).await;

    assert_eq!(next_body(&broker, "notificaciones_dlq").await, b"{not json".to_vec());

    manager.stop().await;
}

#[tokio::test]
async fn test_without_dead_letter_queue_permanent_failures_are_discarded() {
    let broker = InMemoryBroker::new();
    let config = Config {
        dead_letter_queue: None,
        ..config()
    };
    let manager = manager(&broker, &config);
    manager.start().await.unwrap();

    publish(&broker, &json!({"eventType": "ListaBorrada", "data": {}}));
    settled(&manager, |c| c.discarded == 1).await;

    assert!(!broker.has_queue("notificaciones_dlq"));
    assert_eq!(manager.status().await.consumers[0].counters.discarded, 1);

    manager.stop().await;
}

#[tokio::test]
async fn test_disabled_messaging_never_connects() {
    let broker = InMemoryBroker::new();
    let config = Config {
        messaging_enabled: false,
        ..config()
    };
    let manager = manager(&broker, &config);

    manager.start().await.unwrap();

    assert_eq!(broker.connect_attempts(), 0);
    let status = manager.status().await;
    assert!(!status.enabled);
    assert!(!status.is_running);
    assert!(status.healthy);
}

#[tokio::test]
async fn test_consumer_resumes_after_broker_restart() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, &config());
    manager.start().await.unwrap();

    broker.close_all_connections("broker restarted");
    eventually(|| broker.connect_attempts() >= 2 && broker.open_connections() == 1).await;

    publish(
        &broker,
        &json!({
            "eventType": "UsuarioRegistrado",
            "data": {"email": "a@b.com", "nombre": "Ana", "confirmationToken": "tok1"}
        }),
    );
    settled(&manager, |c| c.acked == 1).await;

    manager.stop().await;
}

#[tokio::test]
async fn test_typed_events_published_by_a_producer_are_consumed() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, &config());
    manager.start().await.unwrap();

    let connection = broker.connect("memory://").await.unwrap();
    let publisher = EventPublisher::new(connection.channel().await.unwrap(), "lista_compra_exchange");

    let payload = UserRegisteredPayload {
        user_id: Some("U9".to_string()),
        email: "nuevo@example.com".to_string(),
        name: "Nuevo".to_string(),
        confirmation_token: Some("tok9".to_string()),
    };
    publisher
        .publish("notificaciones", &EventEnvelope::new("UsuarioRegistrado", payload))
        .await
        .unwrap();
    settled(&manager, |c| c.acked == 1).await;

    assert_eq!(broker.queue_depth("notificaciones_dlq"), 0);

    manager.stop().await;
    connection.close().await.unwrap();
}
