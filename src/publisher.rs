//! Publisher role.
//!
//! Sends messages to the topology's entry exchange: the direct exchange when
//! one is configured, otherwise the primary fanout exchange.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::broker::{Broker, Message, Result};
use crate::topology::TopologyConfig;

/// Publisher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Routing key. The direct entry exchange is bound with the empty key.
    pub routing_key: String,
    /// Content type attached to published messages.
    pub content_type: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            routing_key: String::new(),
            content_type: "text/plain".to_string(),
        }
    }
}

pub struct Publisher {
    broker: Arc<dyn Broker>,
    exchange: String,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        topology: &TopologyConfig,
        config: PublisherConfig,
    ) -> Self {
        Self {
            broker,
            exchange: topology.entry_exchange().to_string(),
            config,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publish a message body with the configured content type.
    pub async fn publish(&self, body: impl Into<Vec<u8>>) -> Result<()> {
        let message = Message::new(body).with_content_type(self.config.content_type.clone());
        self.broker
            .publish(&self.exchange, &self.config.routing_key, message)
            .await?;

        info!(
            exchange = %self.exchange,
            routing_key = %self.config.routing_key,
            "Published message"
        );
        Ok(())
    }
}
