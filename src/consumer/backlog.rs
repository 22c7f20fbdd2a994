//! Backlog drain consumer.
//!
//! Drains the durable backlog queue that collects messages the primary
//! exchange could not route while no live queue was bound. When the delivery
//! stream closes, the queue is unbound from the alternate exchange.
//!
//! ```text
//! Draining --(stream closed)--> Unbound
//!     \------(shutdown)-------> Cancelled
//! ```

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::MessageHandler;
use crate::broker::{Broker, BrokerError, ConsumeOptions, DeliveryStream, Message};
use crate::topology::{self, Backlog, BootstrapStep, TopologyError};

/// Backlog consumer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// Subscribed and handing messages to the handler.
    Draining,
    /// Stream closed; unbind from the alternate exchange was attempted.
    Unbound,
    /// Shutdown observed while draining. The binding is left in place.
    Cancelled,
}

/// Outcome of a backlog drain.
#[derive(Debug, Clone)]
pub struct DrainReport {
    pub state: DrainState,
    /// Messages handed to the handler.
    pub processed: u64,
    /// Set when the unbind was attempted and failed.
    pub unbind_error: Option<BrokerError>,
}

/// Consumes the backlog queue until its stream closes.
pub struct BacklogConsumer {
    broker: Arc<dyn Broker>,
    backlog: Backlog,
    stream: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    state: DrainState,
    processed: u64,
}

impl BacklogConsumer {
    /// Register an auto-acknowledging consumer on the backlog queue.
    pub async fn subscribe(
        broker: Arc<dyn Broker>,
        backlog: Backlog,
        handler: Arc<dyn MessageHandler>,
    ) -> topology::Result<Self> {
        let stream = broker
            .consume(&backlog.queue, ConsumeOptions::auto_ack())
            .await
            .map_err(TopologyError::at(
                BootstrapStep::ConsumeBacklogQueue,
                &backlog.queue,
            ))?;

        info!(queue = %backlog.queue, "Waiting for unprocessed messages");

        Ok(Self {
            broker,
            backlog,
            stream,
            handler,
            state: DrainState::Draining,
            processed: 0,
        })
    }

    pub fn state(&self) -> DrainState {
        self.state
    }

    /// Drain until the stream closes or shutdown is signalled.
    ///
    /// Dropping the shutdown sender counts as a shutdown signal.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DrainReport {
        let mut unbind_error = None;

        if *shutdown.borrow() {
            self.state = DrainState::Cancelled;
        }

        while self.state == DrainState::Draining {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(queue = %self.backlog.queue, "Backlog consumer cancelled");
                        self.state = DrainState::Cancelled;
                    }
                }
                next = self.stream.next() => match next {
                    Some(Ok(message)) => self.process(message).await,
                    Some(Err(e)) => {
                        error!(queue = %self.backlog.queue, error = %e, "Backlog delivery error");
                        unbind_error = self.unbind().await.err();
                    }
                    None => {
                        info!(
                            queue = %self.backlog.queue,
                            processed = self.processed,
                            "Backlog stream closed"
                        );
                        unbind_error = self.unbind().await.err();
                    }
                },
            }
        }

        DrainReport {
            state: self.state,
            processed: self.processed,
            unbind_error,
        }
    }

    async fn process(&mut self, message: Message) {
        self.processed += 1;
        if let Err(e) = self.handler.handle(Arc::new(message)).await {
            warn!(queue = %self.backlog.queue, error = %e, "Pending message handler failed");
        }
    }

    /// Transition to `Unbound`. Failure is logged and returned, never raised.
    async fn unbind(&mut self) -> Result<(), BrokerError> {
        self.state = DrainState::Unbound;
        let result = self
            .broker
            .unbind_queue(&self.backlog.queue, &self.backlog.exchange, "")
            .await;

        match &result {
            Ok(()) => info!(
                queue = %self.backlog.queue,
                exchange = %self.backlog.exchange,
                "Unbound backlog queue"
            ),
            Err(e) => warn!(
                queue = %self.backlog.queue,
                exchange = %self.backlog.exchange,
                error = %e,
                "Error unbinding from queue"
            ),
        }
        result
    }
}
