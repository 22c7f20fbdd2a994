//! In-memory broker for tests and local runs.
//!
//! Implements the routing rules the topology depends on: direct and fanout
//! exchanges, exchange-to-exchange bindings, alternate exchanges for
//! unroutable messages, durable/auto-delete queues and the default exchange.
//! Messages published to a queue with no consumer are buffered until one
//! subscribes.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    Broker, BrokerError, ConsumeOptions, DeliveryStream, ExchangeKind, ExchangeOptions, Message,
    QueueOptions, Result,
};


#[derive(Debug, Clone, PartialEq, Eq)]
enum Destination {
    Queue(String),
    Exchange(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    destination: Destination,
    routing_key: String,
}

struct ExchangeState {
    kind: ExchangeKind,
    options: ExchangeOptions,
    bindings: Vec<Binding>,
}

impl ExchangeState {
    fn matching(&self, routing_key: &str) -> Vec<Destination> {
        self.bindings
            .iter()
            .filter(|b| match self.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => b.routing_key == routing_key,
            })
            .map(|b| b.destination.clone())
            .collect()
    }
}

struct ConsumerSlot {
    id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct QueueState {
    options: QueueOptions,
    messages: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    /// Hand the message to the next live consumer, or buffer it.
    fn enqueue(&mut self, message: Message) {
        let mut message = message;
        while !self.consumers.is_empty() {
            let idx = self.next_consumer % self.consumers.len();
            match self.consumers[idx].sender.send(message) {
                Ok(()) => {
                    self.next_consumer = idx + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.consumers.remove(idx);
                    message = returned;
                }
            }
        }
        self.messages.push_back(message);
    }

    fn flush_to(&mut self, slot: &ConsumerSlot) {
        while let Some(message) = self.messages.pop_front() {
            if let Err(mpsc::error::SendError(returned)) = slot.sender.send(message) {
                self.messages.push_front(returned);
                return;
            }
        }
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    closed: bool,
    next_consumer_id: u64,
    fail_on_unbind: bool,
    unbind_calls: usize,
}

impl State {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn exchange_mut(&mut self, name: &str) -> Result<&mut ExchangeState> {
        self.exchanges
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(format!("no exchange '{}'", name)))
    }

    fn delete_queue(&mut self, name: &str) -> bool {
        let removed = self.queues.remove(name).is_some();
        if removed {
            let destination = Destination::Queue(name.to_string());
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|b| b.destination != destination);
            }
        }
        removed
    }

    /// Route a message through `exchange`, returning how many queues got it.
    ///
    /// An exchange that routes to nothing hands the message to its alternate
    /// exchange, if it has one. `visited` breaks binding cycles.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        visited: &mut Vec<String>,
    ) -> usize {
        if visited.iter().any(|v| v == exchange) {
            return 0;
        }
        visited.push(exchange.to_string());

        let (destinations, alternate) = match self.exchanges.get(exchange) {
            Some(state) => (
                state.matching(routing_key),
                state.options.alternate_exchange.clone(),
            ),
            None => return 0,
        };

        let mut routed = 0;
        for destination in destinations {
            match destination {
                Destination::Queue(queue) => {
                    if let Some(q) = self.queues.get_mut(&queue) {
                        q.enqueue(message.clone());
                        routed += 1;
                    }
                }
                Destination::Exchange(next) => {
                    routed += self.route(&next, routing_key, message, visited);
                }
            }
        }

        if routed == 0 {
            if let Some(alternate) = alternate {
                debug!(
                    exchange = %exchange,
                    alternate = %alternate,
                    "Unroutable, using alternate exchange"
                );
                routed += self.route(&alternate, routing_key, message, visited);
            }
        }
        routed
    }
}

struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker.
///
/// Clones share the same exchanges and queues, like separate channels on one
/// broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        info!("In-memory broker initialized");
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Make every subsequent unbind fail.
    pub fn set_fail_on_unbind(&self, fail: bool) {
        self.inner.state().fail_on_unbind = fail;
    }

    /// Number of unbind calls received, failed or not.
    pub fn unbind_calls(&self) -> usize {
        self.inner.state().unbind_calls
    }

    /// Messages buffered in a queue, or `None` if the queue does not exist.
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.inner.state().queues.get(queue).map(|q| q.messages.len())
    }

    /// Active consumers on a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().filter(|c| !c.sender.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state().queues.contains_key(queue)
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.inner.state().exchanges.contains_key(exchange)
    }

    /// Whether `queue` is bound to `exchange` under any key.
    pub fn is_bound(&self, queue: &str, exchange: &str) -> bool {
        let destination = Destination::Queue(queue.to_string());
        self.inner
            .state()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.iter().any(|b| b.destination == destination))
            .unwrap_or(false)
    }

    /// Cancel every consumer of a queue from the broker side. Their delivery
    /// streams end; buffered messages stay in the queue.
    pub fn cancel_consumers(&self, queue: &str) {
        if let Some(q) = self.inner.state().queues.get_mut(queue) {
            q.consumers.clear();
        }
    }

    /// Delete a queue and its bindings. Consumers see end of stream.
    pub fn delete_queue(&self, queue: &str) -> bool {
        self.inner.state().delete_queue(queue)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()> {
        let mut state = self.inner.state();
        state.ensure_open()?;

        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != kind || existing.options != options {
                return Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for exchange '{}'",
                    name
                )));
            }
            return Ok(());
        }

        if let Some(alternate) = &options.alternate_exchange {
            if !state.exchanges.contains_key(alternate) {
                return Err(BrokerError::NotFound(format!(
                    "alternate exchange '{}' for '{}'",
                    alternate, name
                )));
            }
        }

        debug!(exchange = %name, kind = %kind, "Declared exchange");
        state.exchanges.insert(
            name.to_string(),
            ExchangeState {
                kind,
                options,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let mut state = self.inner.state();
        state.ensure_open()?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.options != options {
                return Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{}'",
                    name
                )));
            }
            return Ok(name);
        }

        debug!(queue = %name, durable = options.durable, "Declared queue");
        state.queues.insert(name.clone(), QueueState::new(options));
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.inner.state();
        state.ensure_open()?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("no queue '{}'", queue)));
        }
        let binding = Binding {
            destination: Destination::Queue(queue.to_string()),
            routing_key: routing_key.to_string(),
        };
        let exchange = state.exchange_mut(exchange)?;
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.inner.state();
        state.unbind_calls += 1;
        state.ensure_open()?;

        if state.fail_on_unbind {
            return Err(BrokerError::Channel(format!(
                "unbind of '{}' from '{}' rejected",
                queue, exchange
            )));
        }

        let binding = Binding {
            destination: Destination::Queue(queue.to_string()),
            routing_key: routing_key.to_string(),
        };
        state.exchange_mut(exchange)?.bindings.retain(|b| *b != binding);
        Ok(())
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()> {
        let mut state = self.inner.state();
        state.ensure_open()?;

        if !state.exchanges.contains_key(destination) {
            return Err(BrokerError::NotFound(format!("no exchange '{}'", destination)));
        }
        let binding = Binding {
            destination: Destination::Exchange(destination.to_string()),
            routing_key: routing_key.to_string(),
        };
        let source = state.exchange_mut(source)?;
        if !source.bindings.contains(&binding) {
            source.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _options: ConsumeOptions) -> Result<DeliveryStream> {
        let mut state = self.inner.state();
        state.ensure_open()?;

        let id = state.next_consumer_id;
        state.next_consumer_id += 1;

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("no queue '{}'", queue)))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let slot = ConsumerSlot { id, sender };
        q.flush_to(&slot);
        q.consumers.push(slot);

        debug!(queue = %queue, consumer = id, "Consumer registered");

        Ok(Box::pin(MemoryDelivery {
            receiver,
            _guard: ConsumerGuard {
                inner: Arc::downgrade(&self.inner),
                queue: queue.to_string(),
                id,
            },
        }))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()> {
        let mut state = self.inner.state();
        state.ensure_open()?;

        // Default exchange: route straight to the queue named by the key.
        if exchange.is_empty() {
            if let Some(q) = state.queues.get_mut(routing_key) {
                q.enqueue(message);
            }
            return Ok(());
        }

        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("no exchange '{}'", exchange)));
        }

        let routed = state.route(exchange, routing_key, &message, &mut Vec::new());
        debug!(exchange = %exchange, routed, "Published message");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.inner.state();
        state.closed = true;
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
        info!("In-memory broker closed");
        Ok(())
    }
}

/// Removes the consumer when its stream is dropped and deletes auto-delete
/// queues left without consumers.
struct ConsumerGuard {
    inner: Weak<Inner>,
    queue: String,
    id: u64,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.state();
        let delete = match state.queues.get_mut(&self.queue) {
            Some(q) => {
                q.consumers.retain(|c| c.id != self.id);
                q.options.auto_delete && q.consumers.is_empty()
            }
            None => false,
        };
        if delete {
            state.delete_queue(&self.queue);
            debug!(queue = %self.queue, "Auto-deleted queue");
        }
    }
}

struct MemoryDelivery {
    receiver: mpsc::UnboundedReceiver<Message>,
    _guard: ConsumerGuard,
}

impl Stream for MemoryDelivery {
    type Item = Result<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx).map(|m| m.map(Ok))
    }
}
