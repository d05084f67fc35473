//! Broker transport for request/reply and notification messaging.
//!
//! This module contains:
//! - `Broker` trait: one connection attempt yielding a shared channel
//! - `BrokerChannel` trait: durable declare, publish, no-ack consume, liveness, close
//! - Wire message types and error taxonomy
//! - Implementations: AMQP (RabbitMQ), Mock

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use mock::{MockBroker, MockChannel};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
///
/// Only `Connection`, `Declare`, `Publish`, `Serialization` and `Timeout` ever
/// reach callers of the messaging service. `Close` is logged and swallowed.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Queue declaration failed for '{queue}': {message}")]
    Declare { queue: String, message: String },

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No reply for correlation id '{0}' before the deadline")]
    Timeout(String),

    #[error("Close failed: {0}")]
    Close(String),
}

/// Per-message failures on the reply path. Never propagated to a requester.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Reply carries no correlation id")]
    MissingCorrelationId,

    #[error("Reply body for '{correlation_id}' is not valid JSON: {source}")]
    MalformedBody {
        correlation_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("No pending request for correlation id '{0}'")]
    UnknownCorrelationId(String),

    #[error("Response handler for '{0}' panicked")]
    HandlerPanicked(String),
}

// ============================================================================
// Wire types
// ============================================================================

/// Message handed to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Serialized payload.
    pub body: Vec<u8>,
    /// Correlation id linking a request to its reply.
    pub correlation_id: Option<String>,
    /// Queue the reply should be sent to.
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    /// Plain message with no metadata (notifications).
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Request message carrying correlation metadata.
    pub fn request(
        body: Vec<u8>,
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            body,
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
        }
    }
}

/// Message received from a consumed queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    /// Raw body as delivered.
    pub body: Vec<u8>,
    /// Correlation id from message properties, if any.
    pub correlation_id: Option<String>,
    /// Reply destination from message properties, set on incoming requests.
    pub reply_to: Option<String>,
}

impl InboundMessage {
    pub fn new(body: impl Into<Vec<u8>>, correlation_id: Option<String>) -> Self {
        Self {
            body: body.into(),
            correlation_id,
            reply_to: None,
        }
    }

    /// Reply for a given correlation id with a JSON body.
    pub fn reply(correlation_id: impl Into<String>, body: &serde_json::Value) -> Self {
        Self::new(body.to_string().into_bytes(), Some(correlation_id.into()))
    }
}

/// Stream of deliveries from a no-ack consumer.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage>>;

// ============================================================================
// Traits
// ============================================================================

/// Factory for broker channels.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP 0-9-1
/// - `MockBroker`: In-memory mock for testing
#[async_trait]
pub trait Broker: Send + Sync {
    /// Make a single attempt to open a connection and derive a channel.
    ///
    /// Retry policy belongs to the caller.
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>>;
}

/// A live channel on an open broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable queue. Safe to repeat.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Hand a message to the broker for delivery to `queue`.
    ///
    /// Success means the transport accepted it, not that anyone consumed it.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()>;

    /// Start a no-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Whether both the channel and its connection are still usable.
    ///
    /// Turns false when the broker closes either side, e.g. after a restart.
    fn is_open(&self) -> bool;

    /// Release the channel and its connection.
    ///
    /// The connection is released even when closing the channel fails; the
    /// first error is returned.
    async fn close(&self) -> Result<()>;
}
