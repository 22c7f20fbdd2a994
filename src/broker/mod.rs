//! Broker capability contract.
//!
//! This module contains:
//! - `Broker` trait: exchange/queue declaration, binding, publish and consume
//! - Message and option types shared by every implementation
//! - Implementations: AMQP (RabbitMQ via lapin), in-memory

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Re-declaration with parameters that differ from the existing resource.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Broker connection closed")]
    Closed,
}

// ============================================================================
// Types
// ============================================================================

/// Exchange routing kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes to bindings whose key equals the routing key.
    Direct,
    /// Routes to every binding regardless of key.
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
        }
    }
}

/// Exchange declaration options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    /// Exchange receiving messages this exchange could not route.
    pub alternate_exchange: Option<String>,
}

/// Queue declaration options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,
}

/// Consumer registration options.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Treat messages as acknowledged on delivery.
    pub auto_ack: bool,
    /// Consumer tag. Empty lets the broker pick one.
    pub tag: String,
}

impl ConsumeOptions {
    /// Auto-acknowledging consumer with a broker-generated tag.
    pub fn auto_ack() -> Self {
        Self {
            auto_ack: true,
            tag: String::new(),
        }
    }
}

/// A message in transit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
        }
    }

    /// Plain-text message with `text/plain` content type.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into().into_bytes(),
            content_type: Some("text/plain".to_string()),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Body as UTF-8, replacing invalid sequences.
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Stream of deliveries for one consumer.
///
/// Lazy and non-restartable. Ends when the broker closes the channel or
/// connection, or deletes the queue.
pub type DeliveryStream = BoxStream<'static, Result<Message>>;

// ============================================================================
// Trait
// ============================================================================

/// Operations this system needs from a publish/subscribe broker.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP 0.9.1
/// - `MemoryBroker`: in-process routing for tests and local runs
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare an exchange. Fails with `PreconditionFailed` if an exchange
    /// with the same name exists with different parameters.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()>;

    /// Declare a queue and return its name. An empty name requests a
    /// broker-generated unique name.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    /// Bind a queue to an exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Remove a queue binding.
    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Bind `destination` exchange so it receives what `source` routes to it.
    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str)
        -> Result<()>;

    /// Start consuming from a queue.
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream>;

    /// Publish a message to an exchange.
    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()>;

    /// Close the connection. Open delivery streams end.
    async fn close(&self) -> Result<()>;
}
