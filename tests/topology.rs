//! End-to-end scenarios against the in-memory broker.
//!
//! Run with: cargo test --test topology --features test-utils
//!
//! Exercises publisher, topology and supervisor together without RabbitMQ.

use std::sync::Arc;
use std::time::Duration;

use alternator::broker::{MemoryBroker, Message};
use alternator::consumer::{DrainState, LiveExit};
use alternator::publisher::{Publisher, PublisherConfig};
use alternator::supervisor::{RunningSupervisor, Supervisor};
use alternator::test_utils::{declare_topology, CountingHandler};
use alternator::topology::{TopologyBuilder, TopologyConfig};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(1);

async fn next_body(rx: &mut mpsc::UnboundedReceiver<Arc<Message>>) -> String {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("Timed out waiting for message")
        .expect("Handler channel closed")
        .body_lossy()
        .into_owned()
}

struct Subscriber {
    running: RunningSupervisor,
    backlog_rx: mpsc::UnboundedReceiver<Arc<Message>>,
    live_rx: mpsc::UnboundedReceiver<Arc<Message>>,
}

async fn start_subscriber(broker: &MemoryBroker, config: &TopologyConfig) -> Subscriber {
    let (backlog_handler, backlog_rx) = CountingHandler::with_channel();
    let (live_handler, live_rx) = CountingHandler::with_channel();
    let running = Supervisor::new(Arc::new(broker.clone()), config.clone())
        .with_handlers(Arc::new(backlog_handler), Arc::new(live_handler))
        .start()
        .await
        .expect("Failed to start subscriber");

    Subscriber {
        running,
        backlog_rx,
        live_rx,
    }
}

fn publisher(broker: &MemoryBroker, config: &TopologyConfig) -> Publisher {
    Publisher::new(Arc::new(broker.clone()), config, PublisherConfig::default())
}

#[tokio::test]
async fn test_hello_reaches_live_subscriber_only() {
    let broker = MemoryBroker::new();
    let config = TopologyConfig::default();
    let mut subscriber = start_subscriber(&broker, &config).await;
    let backlog_queue = subscriber.running.topology().backlog().unwrap().queue.clone();

    publisher(&broker, &config).publish("hello").await.unwrap();

    assert_eq!(next_body(&mut subscriber.live_rx).await, "hello");
    assert_eq!(broker.message_count(&backlog_queue), Some(0));
    assert!(subscriber.backlog_rx.try_recv().is_err());

    let handle = subscriber.running.shutdown_handle();
    handle.trigger();
    let report = subscriber.running.run_until(std::future::pending()).await;
    let live = report.live.completed().unwrap();
    assert_eq!(live.received, 1);
    assert_eq!(live.exit, LiveExit::Cancelled);
}

#[tokio::test]
async fn test_orphan_is_drained_then_backlog_unbound() {
    let broker = MemoryBroker::new();
    let config = TopologyConfig::default();
    let backlog = declare_topology(&broker, &config).await.backlog.unwrap();

    publisher(&broker, &config).publish("orphan").await.unwrap();
    assert_eq!(broker.message_count(&backlog.queue), Some(1));

    let mut subscriber = start_subscriber(&broker, &config).await;
    assert_eq!(next_body(&mut subscriber.backlog_rx).await, "orphan");

    broker.cancel_consumers(&backlog.queue);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!broker.is_bound(&backlog.queue, &backlog.exchange));
    assert_eq!(broker.unbind_calls(), 1);

    let report = subscriber.running.run_until(async {}).await;
    let drained = report.backlog.unwrap();
    let drained = drained.completed().unwrap();
    assert_eq!(drained.state, DrainState::Unbound);
    assert_eq!(drained.processed, 1);
    assert!(drained.unbind_error.is_none());
}

#[tokio::test]
async fn test_unbind_failure_keeps_live_consumer_running() {
    let broker = MemoryBroker::new();
    broker.set_fail_on_unbind(true);
    let config = TopologyConfig::default();
    let mut subscriber = start_subscriber(&broker, &config).await;
    let backlog_queue = subscriber.running.topology().backlog().unwrap().queue.clone();

    broker.cancel_consumers(&backlog_queue);
    tokio::time::sleep(Duration::from_millis(50)).await;
    publisher(&broker, &config).publish("after").await.unwrap();

    assert_eq!(next_body(&mut subscriber.live_rx).await, "after");
    assert_eq!(broker.unbind_calls(), 1);

    let report = subscriber.running.run_until(async {}).await;
    let drained = report.backlog.unwrap();
    assert!(drained.completed().unwrap().unbind_error.is_some());
    assert_eq!(report.live.completed().unwrap().exit, LiveExit::Cancelled);
}

#[tokio::test]
async fn test_two_instances_share_backlog_with_distinct_live_queues() {
    let broker = MemoryBroker::new();
    let config = TopologyConfig::default();
    let (mut first, mut second) = tokio::join!(
        start_subscriber(&broker, &config),
        start_subscriber(&broker, &config)
    );

    assert_ne!(
        first.running.topology().live_queue,
        second.running.topology().live_queue
    );
    assert_eq!(
        first.running.topology().backlog(),
        second.running.topology().backlog()
    );

    publisher(&broker, &config).publish("fanout").await.unwrap();
    assert_eq!(next_body(&mut first.live_rx).await, "fanout");
    assert_eq!(next_body(&mut second.live_rx).await, "fanout");
}

#[tokio::test]
async fn test_messages_return_to_backlog_after_live_queue_is_gone() {
    let broker = MemoryBroker::new();
    let config = TopologyConfig::default();
    let builder = TopologyBuilder::new(&broker, &config);
    let shared = builder.declare_shared().await.unwrap();
    let live = builder.declare_live_queue(&shared).await.unwrap();
    let backlog = shared.backlog.unwrap();

    publisher(&broker, &config).publish("seen").await.unwrap();
    assert_eq!(broker.message_count(&live), Some(1));
    assert_eq!(broker.message_count(&backlog.queue), Some(0));

    assert!(broker.delete_queue(&live));
    publisher(&broker, &config).publish("missed").await.unwrap();

    assert_eq!(broker.message_count(&backlog.queue), Some(1));
}
