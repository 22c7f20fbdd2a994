//! AMQP (RabbitMQ) broker implementation.
//!
//! One connection and one channel are shared by topology declaration and every
//! consumer, so a channel-level error closes all delivery streams at once.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info};

use super::{
    Broker, BrokerError, ConsumeOptions, DeliveryStream, ExchangeKind, ExchangeOptions, Message,
    QueueOptions, Result,
};

/// Exchange argument naming the exchange for unroutable messages.
pub const ALTERNATE_EXCHANGE_ARG: &str = "alternate-exchange";

/// AMQP broker using RabbitMQ.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    /// Connect and open the shared channel.
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))?;

        info!(url = %redact(url), "Connected to AMQP");

        Ok(Self {
            connection,
            channel,
        })
    }
}

/// Map lapin errors onto broker errors. A failed declaration closes the
/// channel with a soft protocol error carrying the reply code.
fn map_err(e: lapin::Error) -> BrokerError {
    match &e {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::PreconditionFailed(e.to_string())
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerError::NotFound(e.to_string()),
            _ => BrokerError::Channel(e.to_string()),
        },
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::Closed
        }
        _ => BrokerError::Channel(e.to_string()),
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

/// Strip credentials from a connection URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}***{}", &url[..scheme + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()> {
        let mut arguments = FieldTable::default();
        if let Some(alternate) = &options.alternate_exchange {
            arguments.insert(
                ALTERNATE_EXCHANGE_ARG.into(),
                AMQPValue::LongString(alternate.as_str().into()),
            );
        }

        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(map_err)?;

        debug!(exchange = %name, kind = %kind, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_err)?;

        debug!(queue = %queue.name().as_str(), durable = options.durable, "Declared queue");
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_err)
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(map_err)
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_err)
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_err)?;

        debug!(queue = %queue, tag = %consumer.tag().as_str(), "Consumer registered");

        let stream = consumer.map(|delivery| {
            delivery.map_err(map_err).map(|d| Message {
                content_type: d
                    .properties
                    .content_type()
                    .as_ref()
                    .map(|c| c.as_str().to_string()),
                body: d.data,
            })
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()> {
        let mut properties = BasicProperties::default();
        if let Some(content_type) = &message.content_type {
            properties = properties.with_content_type(content_type.as_str().into());
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(map_err)?
            .await
            .map_err(map_err)?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "Bye")
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to close connection: {}", e)))?;
        info!("AMQP connection closed");
        Ok(())
    }
}
