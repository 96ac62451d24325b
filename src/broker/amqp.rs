// ============================================================================
// RabbitMQ (AMQP 0-9-1) transport
// ============================================================================

use async_trait::async_trait;
use dispatch_error::ConnectionError;
use futures_util::StreamExt;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{acker::Acker, BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

use super::connection::FailureNotifier;
use super::{BrokerChannel, BrokerDialer, Delivery, DeliveryAcker, DeliveryStream, MessageProperties};
use crate::utils::redact_url;

/// AMQP delivery mode 2: written to disk, survives a broker restart
const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Default)]
pub struct AmqpDialer;

impl AmqpDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerDialer for AmqpDialer {
    async fn dial(&self, url: &str, on_failure: FailureNotifier) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        let dial_err = |e: lapin::Error| ConnectionError::Dial {
            url: redact_url(url),
            reason: e.to_string(),
        };

        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(dial_err)?;

        let node = redact_url(url);
        connection.on_error(move |err| {
            error!(node = %node, error = %err, "RabbitMQ connection error");
            on_failure.notify(format!("connection error: {}", err));
        });

        let channel = connection.create_channel().await.map_err(dial_err)?;
        debug!(channel_id = channel.id(), "RabbitMQ channel opened");

        Ok(Arc::new(AmqpChannel { connection, channel }))
    }
}

pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

fn channel_err(e: lapin::Error) -> ConnectionError {
    ConnectionError::Channel(e.to_string())
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_priority_queue(&self, name: &str, max_priority: u8) -> Result<(), ConnectionError> {
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-max-priority"),
            AMQPValue::LongInt(i32::from(max_priority)),
        );

        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .map_err(channel_err)?;
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], properties: &MessageProperties) -> Result<(), ConnectionError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(properties.content_type))
            .with_priority(properties.priority.value());
        if properties.persistent {
            props = props.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }
        if let Some(id) = &properties.message_id {
            props = props.with_message_id(ShortString::from(id.as_str()));
        }

        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, props)
            .await
            .map_err(channel_err)?
            .await
            .map_err(channel_err)?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream, ConnectionError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(channel_err)?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_err)?;

        Ok(consumer
            .map(|item| item.map(into_delivery).map_err(channel_err))
            .boxed())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.channel.status().connected() {
            self.channel.close(200, "closing").await.map_err(channel_err)?;
        }
        if self.connection.status().connected() {
            self.connection.close(200, "closing").await.map_err(channel_err)?;
        }
        Ok(())
    }
}

fn into_delivery(delivery: AmqpDelivery) -> Delivery {
    let AmqpDelivery {
        data,
        properties,
        redelivered,
        acker,
        ..
    } = delivery;

    Delivery::new(
        data,
        *properties.priority(),
        properties.message_id().as_ref().map(|id| id.as_str().to_string()),
        redelivered,
        Arc::new(AmqpAcker(acker)),
    )
}

struct AmqpAcker(Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<(), ConnectionError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(channel_err)
    }

    async fn nack(&self, requeue: bool) -> Result<(), ConnectionError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(channel_err)
    }
}
