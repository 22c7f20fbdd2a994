//! Live queue consumer.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::MessageHandler;
use crate::broker::{Broker, BrokerError, ConsumeOptions, DeliveryStream};
use crate::topology::{self, BootstrapStep, TopologyError};

/// Why the live consumer stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveExit {
    /// Shutdown was signalled.
    Cancelled,
    /// The broker ended the delivery stream.
    StreamClosed,
    /// The broker reported a delivery error.
    DeliveryError(BrokerError),
}

#[derive(Debug, Clone)]
pub struct LiveReport {
    pub exit: LiveExit,
    pub received: u64,
}

/// Consumes this instance's live queue for the lifetime of the process.
pub struct LiveConsumer {
    queue: String,
    stream: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
}

impl LiveConsumer {
    /// Register an auto-acknowledging consumer on the live queue.
    pub async fn subscribe(
        broker: &dyn Broker,
        queue: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> topology::Result<Self> {
        let queue = queue.into();
        let stream = broker
            .consume(&queue, ConsumeOptions::auto_ack())
            .await
            .map_err(TopologyError::at(BootstrapStep::ConsumeLiveQueue, &queue))?;

        Ok(Self {
            queue,
            stream,
            handler,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consume until shutdown or until the broker closes the stream.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> LiveReport {
        let mut received = 0;

        if *shutdown.borrow() {
            return LiveReport {
                exit: LiveExit::Cancelled,
                received,
            };
        }

        let exit = loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break LiveExit::Cancelled;
                    }
                }
                next = self.stream.next() => match next {
                    Some(Ok(message)) => {
                        received += 1;
                        if let Err(e) = self.handler.handle(Arc::new(message)).await {
                            warn!(queue = %self.queue, error = %e, "Message handler failed");
                        }
                    }
                    Some(Err(e)) => {
                        error!(queue = %self.queue, error = %e, "Live delivery error");
                        break LiveExit::DeliveryError(e);
                    }
                    None => break LiveExit::StreamClosed,
                },
            }
        };

        info!(queue = %self.queue, received, exit = ?exit, "Live consumer stopped");
        LiveReport { exit, received }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Message};
    use crate::test_utils::{declare_topology, CountingHandler, FailingHandler};
    use crate::topology::{TopologyBuilder, TopologyConfig};
    use std::time::Duration;

    async fn live_queue(broker: &MemoryBroker) -> String {
        let config = TopologyConfig::fanout_only("events");
        let shared = declare_topology(broker, &config).await;
        TopologyBuilder::new(broker, &config)
            .declare_live_queue(&shared)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_delivers_messages_until_cancelled() {
        let broker = MemoryBroker::new();
        let queue = live_queue(&broker).await;

        let (handler, mut received) = CountingHandler::with_channel();
        let consumer = LiveConsumer::subscribe(&broker, &queue, Arc::new(handler))
            .await
            .unwrap();
        assert_eq!(consumer.queue(), queue);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(rx));

        broker
            .publish("events", "", Message::text("hello"))
            .await
            .unwrap();
        let message = tokio::time::timeout(Duration::from_secs(1), received.recv())
            .await
            .expect("timed out")
            .expect("handler channel closed");
        assert_eq!(message.body_lossy(), "hello");

        tx.send(true).unwrap();
        let report = task.await.unwrap();

        assert_eq!(report.exit, LiveExit::Cancelled);
        assert_eq!(report.received, 1);
    }

    #[tokio::test]
    async fn test_stream_closed_by_broker() {
        let broker = MemoryBroker::new();
        let queue = live_queue(&broker).await;

        let consumer = LiveConsumer::subscribe(&broker, &queue, Arc::new(CountingHandler::new()))
            .await
            .unwrap();
        let (_tx, rx) = watch::channel(false);

        broker.cancel_consumers(&queue);
        let report = consumer.run(rx).await;

        assert_eq!(report.exit, LiveExit::StreamClosed);
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_consumer() {
        let broker = MemoryBroker::new();
        let queue = live_queue(&broker).await;

        let consumer = LiveConsumer::subscribe(&broker, &queue, Arc::new(FailingHandler))
            .await
            .unwrap();
        broker
            .publish("events", "", Message::text("one"))
            .await
            .unwrap();
        broker
            .publish("events", "", Message::text("two"))
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.cancel_consumers(&queue);
        let report = task.await.unwrap();

        assert_eq!(report.received, 2);
        assert_eq!(report.exit, LiveExit::StreamClosed);
    }

    #[tokio::test]
    async fn test_live_queue_auto_deleted_after_consumer_stops() {
        let broker = MemoryBroker::new();
        let queue = live_queue(&broker).await;

        let consumer = LiveConsumer::subscribe(&broker, &queue, Arc::new(CountingHandler::new()))
            .await
            .unwrap();
        let (_tx, rx) = watch::channel(true);
        consumer.run(rx).await;

        assert!(!broker.queue_exists(&queue));
    }
}
