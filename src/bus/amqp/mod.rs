//! AMQP (RabbitMQ) broker implementation.
//!
//! Queues are addressed directly through the default exchange, so the routing
//! key of every publish is the destination queue name.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info};

use super::{
    Broker, BrokerChannel, BusError, DeliveryStream, InboundMessage, OutboundMessage, Result,
};

/// Default exchange; routes by queue name.
const DEFAULT_EXCHANGE: &str = "";

/// Content type stamped on every published message.
const CONTENT_TYPE: &str = "application/json";

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Broker backed by a RabbitMQ server.
#[derive(Clone, Debug)]
pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    /// Create a broker for the given AMQP URL (e.g., amqp://localhost:5672).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "OK").await {
                    debug!(error = %close_err, "Failed to close connection after channel error");
                }
                return Err(BusError::Connection(format!(
                    "Failed to create channel: {}",
                    e
                )));
            }
        };

        info!(url = %self.url, "Connected to AMQP");

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
        }))
    }
}

/// A lapin channel together with the connection that owns it.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

impl AmqpChannel {
    fn properties(message: &OutboundMessage) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(2); // persistent

        if let Some(correlation_id) = &message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }
        if let Some(reply_to) = &message.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }
        properties
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        let properties = Self::properties(&message);

        let confirm = self
            .channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(
            queue = %queue,
            correlation_id = ?message.correlation_id,
            "Published message"
        );
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let consumer_tag = format!("service-essentials-{}", uuid::Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "Consumer started");

        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| InboundMessage {
                    correlation_id: delivery
                        .properties
                        .correlation_id()
                        .as_ref()
                        .map(|id| id.as_str().to_string()),
                    reply_to: delivery
                        .properties
                        .reply_to()
                        .as_ref()
                        .map(|queue| queue.as_str().to_string()),
                    body: delivery.data,
                })
                .map_err(|e| BusError::Consume(format!("Delivery error: {}", e)))
        });

        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected() && self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        let channel = self
            .channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::Close(format!("Failed to close channel: {}", e)));
        let connection = self
            .connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::Close(format!("Failed to close connection: {}", e)));
        first_error(channel, connection)
    }
}

/// Combine two release outcomes, keeping the first failure.
fn first_error(first: Result<()>, second: Result<()>) -> Result<()> {
    first.and(second)
}
