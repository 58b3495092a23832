//! RabbitMQ implementation of the broker traits over `lapin`

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BusError, BusResult, ConnectionEvent,
    Delivery, DeliveryStream, ExchangeKind,
};

/// Persistent delivery mode (survives a broker restart on a durable queue)
const PERSISTENT: u8 = 2;

/// Broker implementation backed by RabbitMQ
///
/// Exchanges and queues are always declared durable. Messages published
/// through [`BrokerChannel::publish`] are persistent JSON.
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, url: &str) -> BusResult<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        let (events, _) = broadcast::channel(16);

        // lapin reports errors once the connection is already unusable, so
        // every error is also a close
        let sender = events.clone();
        connection.on_error(move |err| {
            tracing::error!(error = %err, "RabbitMQ connection error");
            let _ = sender.send(ConnectionEvent::Error(err.to_string()));
            let _ = sender.send(ConnectionEvent::Closed(err.to_string()));
        });

        Ok(Arc::new(AmqpConnection { connection, events }))
    }
}

struct AmqpConnection {
    connection: Connection,
    events: broadcast::Sender<ConnectionEvent>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn channel(&self) -> BusResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::ChannelError(e.to_string()))?;

        Ok(Arc::new(AmqpChannel { channel }))
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
        self.connection.status().connected()
    }

    async fn close(&self) -> BusResult<()> {
        if !self.is_connected() {
            return Ok(());
        }

        self.connection
            .close(200, "normal shutdown")
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        let _ = self
            .events
            .send(ConnectionEvent::Closed("closed by client".to_string()));
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BusResult<()> {
        self.channel
            .exchange_declare(
                name,
                lapin_exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::TopologyError(format!("exchange '{}': {}", name, e)))
    }

    async fn declare_queue(&self, name: &str) -> BusResult<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| BusError::TopologyError(format!("queue '{}': {}", name, e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::TopologyError(format!(
                    "bind '{}' -> '{}' ({}): {}",
                    queue, exchange, routing_key, e
                ))
            })
    }

    async fn set_prefetch(&self, count: u16) -> BusResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::ChannelError(e.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> BusResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::ConsumeError(e.to_string()))?;

        let deliveries = consumer.map(|result| {
            result
                .map(|delivery| {
                    Delivery::new(
                        delivery.delivery_tag,
                        delivery.routing_key.as_str().to_string(),
                        delivery.redelivered,
                        delivery.data,
                        Arc::new(AmqpAcker {
                            acker: delivery.acker,
                        }),
                    )
                })
                .map_err(|e| BusError::ConsumeError(e.to_string()))
        });

        Ok(deliveries.boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> BusResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        confirm
            .await
            .map(|_| ())
            .map_err(|e| BusError::PublishError(format!("confirmation failed: {}", e)))
    }

    async fn close(&self) -> BusResult<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(200, "normal shutdown")
            .await
            .map_err(|e| BusError::ChannelError(e.to_string()))
    }
}

/// Settles one lapin delivery. The lapin acker already knows its tag.
struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, _delivery_tag: u64) -> BusResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn nack(&self, _delivery_tag: u64, requeue: bool) -> BusResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn reject(&self, _delivery_tag: u64, requeue: bool) -> BusResult<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}
