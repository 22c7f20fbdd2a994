//! Test utilities and mock implementations.
//!
//! Handlers and a recording broker for exercising the topology and consumers
//! without a running RabbitMQ.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::broker::{
    Broker, BrokerError, ConsumeOptions, DeliveryStream, ExchangeKind, ExchangeOptions,
    MemoryBroker, Message, QueueOptions, Result as BrokerResult,
};
use crate::consumer::{HandlerError, MessageHandler};
use crate::topology::{SharedTopology, TopologyBuilder, TopologyConfig};

/// Handler that counts messages and optionally forwards them to a channel.
#[derive(Default)]
pub struct CountingHandler {
    count: Arc<AtomicUsize>,
    tx: Option<mpsc::UnboundedSender<Arc<Message>>>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler plus a receiver that sees every handled message.
    pub fn with_channel() -> (Self, mpsc::UnboundedReceiver<Arc<Message>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                count: Arc::new(AtomicUsize::new(0)),
                tx: Some(tx),
            },
            rx,
        )
    }

    pub fn count(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }
}

impl MessageHandler for CountingHandler {
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let count = self.count.clone();
        let tx = self.tx.clone();
        Box::pin(async move {
            count.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = tx {
                let _ = tx.send(message);
            }
            Ok(())
        })
    }
}

/// Handler that fails every message.
pub struct FailingHandler;

impl MessageHandler for FailingHandler {
    fn handle(&self, _message: Arc<Message>) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(async { Err(HandlerError("rejected".to_string())) })
    }
}

/// Declare the shared part of a topology, panicking on failure.
pub async fn declare_topology(broker: &MemoryBroker, config: &TopologyConfig) -> SharedTopology {
    TopologyBuilder::new(broker, config)
        .declare_shared()
        .await
        .expect("Failed to declare topology")
}

/// Broker wrapper that records every call and can fail a chosen one.
///
/// Calls are recorded as `"<operation> <resource>"`, e.g.
/// `"declare_exchange poc.messages"`.
pub struct RecordingBroker {
    inner: MemoryBroker,
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingBroker {
    pub fn new(inner: MemoryBroker) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        }
    }

    /// Fail the call whose record equals `call`.
    pub fn fail_on(&self, call: impl Into<String>) {
        *self.fail_on.lock().unwrap_or_else(PoisonError::into_inner) = Some(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, operation: &str, resource: &str) -> BrokerResult<()> {
        let call = format!("{} {}", operation, resource);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());
        let fail = self
            .fail_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            == Some(call.as_str());
        if fail {
            return Err(BrokerError::Channel(format!("injected failure: {}", call)));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BrokerResult<()> {
        self.record("declare_exchange", name)?;
        self.inner.declare_exchange(name, kind, options).await
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BrokerResult<String> {
        // Live queue names are random; record the exchange suffix only.
        let resource = match name.split_once('@') {
            Some((prefix, suffix)) if prefix != "alternate" => format!("*@{}", suffix),
            _ => name.to_string(),
        };
        self.record("declare_queue", &resource)?;
        self.inner.declare_queue(name, options).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.record("bind_queue", exchange)?;
        self.inner.bind_queue(queue, exchange, routing_key).await
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.record("unbind_queue", exchange)?;
        self.inner.unbind_queue(queue, exchange, routing_key).await
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.record("bind_exchange", source)?;
        self.inner.bind_exchange(destination, source, routing_key).await
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> BrokerResult<DeliveryStream> {
        self.record("consume", queue)?;
        self.inner.consume(queue, options).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> BrokerResult<()> {
        self.record("publish", exchange)?;
        self.inner.publish(exchange, routing_key, message).await
    }

    async fn close(&self) -> BrokerResult<()> {
        self.record("close", "")?;
        self.inner.close().await
    }
}
