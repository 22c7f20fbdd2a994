//! Lifecycle supervisor.
//!
//! Bootstraps the topology and registers both consumers on the calling task.
//! Any error up to that point is returned before a task is spawned, so a
//! failed start leaves nothing running. After that the backlog and live
//! consumers run as separate tasks until a shutdown signal arrives; the
//! backlog consumer finishing on its own does not stop the live consumer.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::consumer::{
    BacklogConsumer, DrainReport, LiveConsumer, LiveReport, LogHandler, MessageHandler,
};
use crate::topology::{self, Topology, TopologyBuilder, TopologyConfig};

/// How a supervised task ended.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Panicked(String),
    Aborted,
}

impl<T> From<Result<T, JoinError>> for TaskOutcome<T> {
    fn from(result: Result<T, JoinError>) -> Self {
        match result {
            Ok(report) => TaskOutcome::Completed(report),
            Err(e) if e.is_panic() => TaskOutcome::Panicked(e.to_string()),
            Err(_) => TaskOutcome::Aborted,
        }
    }
}

impl<T> TaskOutcome<T> {
    pub fn completed(&self) -> Option<&T> {
        match self {
            TaskOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Final state of both consumers after shutdown.
#[derive(Debug)]
pub struct SupervisorReport {
    /// `None` when the topology has no backlog.
    pub backlog: Option<TaskOutcome<DrainReport>>,
    pub live: TaskOutcome<LiveReport>,
}

/// Triggers shutdown of a running supervisor.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// Starts the topology and the two consumers.
pub struct Supervisor {
    broker: Arc<dyn Broker>,
    config: TopologyConfig,
    backlog_handler: Arc<dyn MessageHandler>,
    live_handler: Arc<dyn MessageHandler>,
}

impl Supervisor {
    /// Supervisor whose handlers log every message.
    pub fn new(broker: Arc<dyn Broker>, config: TopologyConfig) -> Self {
        Self {
            broker,
            config,
            backlog_handler: Arc::new(LogHandler::pending()),
            live_handler: Arc::new(LogHandler::received()),
        }
    }

    pub fn with_handlers(
        mut self,
        backlog: Arc<dyn MessageHandler>,
        live: Arc<dyn MessageHandler>,
    ) -> Self {
        self.backlog_handler = backlog;
        self.live_handler = live;
        self
    }

    /// Bootstrap, register both consumers, then spawn them.
    pub async fn start(self) -> topology::Result<RunningSupervisor> {
        let topology = TopologyBuilder::new(self.broker.as_ref(), &self.config)
            .bootstrap()
            .await?;

        let backlog = match topology.backlog() {
            Some(backlog) => Some(
                BacklogConsumer::subscribe(
                    self.broker.clone(),
                    backlog.clone(),
                    self.backlog_handler,
                )
                .await?,
            ),
            None => None,
        };

        let live = LiveConsumer::subscribe(
            self.broker.as_ref(),
            topology.live_queue.as_str(),
            self.live_handler,
        )
        .await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let backlog = backlog.map(|consumer| tokio::spawn(consumer.run(shutdown_rx.clone())));
        let live = tokio::spawn(live.run(shutdown_rx));

        info!(
            queue = %topology.live_queue,
            exchange = %topology.primary_exchange(),
            "Waiting for messages"
        );

        Ok(RunningSupervisor {
            broker: self.broker,
            topology,
            shutdown: Arc::new(shutdown),
            backlog,
            live: Some(live),
        })
    }
}

/// Supervisor with both consumers running.
pub struct RunningSupervisor {
    broker: Arc<dyn Broker>,
    topology: Topology,
    shutdown: Arc<watch::Sender<bool>>,
    backlog: Option<JoinHandle<DrainReport>>,
    live: Option<JoinHandle<LiveReport>>,
}

impl RunningSupervisor {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Wait for `signal` or a `ShutdownHandle` trigger, then stop both
    /// consumers and close the broker connection.
    pub async fn run_until<F>(mut self, signal: F) -> SupervisorReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut backlog_outcome = None;
        let mut live_outcome = None;

        if !*shutdown_rx.borrow() {
            loop {
                tokio::select! {
                    _ = &mut signal => {
                        info!("Shutdown signal received");
                        break;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown requested");
                            break;
                        }
                    }
                    result = join_next(&mut self.backlog) => {
                        self.backlog = None;
                        let outcome = TaskOutcome::from(result);
                        log_backlog(&outcome);
                        backlog_outcome = Some(outcome);
                    }
                    result = join_next(&mut self.live) => {
                        self.live = None;
                        let outcome = TaskOutcome::from(result);
                        log_live(&outcome);
                        live_outcome = Some(outcome);
                    }
                }
            }
        }

        self.shutdown.send_replace(true);

        if let Some(handle) = self.backlog.take() {
            backlog_outcome = Some(TaskOutcome::from(handle.await));
        }
        if let Some(handle) = self.live.take() {
            live_outcome = Some(TaskOutcome::from(handle.await));
        }

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Failed to close broker connection");
        }

        SupervisorReport {
            backlog: backlog_outcome,
            live: live_outcome.unwrap_or(TaskOutcome::Aborted),
        }
    }

    /// Like `run_until`, for signals that can fail to register. A failed
    /// signal still stops both consumers; its error is logged and returned.
    pub async fn run_until_ok<F, E>(self, signal: F) -> Result<SupervisorReport, E>
    where
        F: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let mut signal_result = Ok(());
        let slot = &mut signal_result;
        let report = self
            .run_until(async move {
                *slot = signal.await;
            })
            .await;

        match signal_result {
            Ok(()) => Ok(report),
            Err(e) => {
                error!(error = %e, "Failed to wait for shutdown signal");
                Err(e)
            }
        }
    }
}

/// Await a task if it is still tracked; pend forever otherwise.
async fn join_next<T>(handle: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn log_backlog(outcome: &TaskOutcome<DrainReport>) {
    match outcome {
        TaskOutcome::Completed(report) => info!(
            state = ?report.state,
            processed = report.processed,
            "Backlog drained"
        ),
        TaskOutcome::Panicked(message) => error!(error = %message, "Backlog consumer panicked"),
        TaskOutcome::Aborted => warn!("Backlog consumer aborted"),
    }
}

fn log_live(outcome: &TaskOutcome<LiveReport>) {
    match outcome {
        TaskOutcome::Completed(report) => warn!(
            exit = ?report.exit,
            received = report.received,
            "Live consumer stopped before shutdown"
        ),
        TaskOutcome::Panicked(message) => error!(error = %message, "Live consumer panicked"),
        TaskOutcome::Aborted => warn!("Live consumer aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Message};
    use crate::consumer::{DrainState, HandlerError, LiveExit};
    use crate::test_utils::{declare_topology, CountingHandler, RecordingBroker};
    use crate::topology::BootstrapStep;
    use futures::future::BoxFuture;
    use std::time::Duration;

    struct PanickingHandler;

    impl MessageHandler for PanickingHandler {
        fn handle(&self, _message: Arc<Message>) -> BoxFuture<'static, Result<(), HandlerError>> {
            Box::pin(async { panic!("handler exploded") })
        }
    }

    async fn recv(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Arc<Message>>) -> String {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("handler channel closed")
            .body_lossy()
            .into_owned()
    }

    #[tokio::test]
    async fn test_live_message_and_shutdown() {
        let broker = MemoryBroker::new();
        let (backlog_handler, _) = CountingHandler::with_channel();
        let (live_handler, mut live_rx) = CountingHandler::with_channel();

        let running = Supervisor::new(
            Arc::new(broker.clone()),
            TopologyConfig::full("poc.messages"),
        )
        .with_handlers(Arc::new(backlog_handler), Arc::new(live_handler))
        .start()
        .await
        .unwrap();
        let handle = running.shutdown_handle();
        let task = tokio::spawn(running.run_until(std::future::pending()));

        broker
            .publish("direct", "", Message::text("hello"))
            .await
            .unwrap();
        assert_eq!(recv(&mut live_rx).await, "hello");

        handle.trigger();
        let report = task.await.unwrap();

        let live = report.live.completed().unwrap();
        assert_eq!(live.exit, LiveExit::Cancelled);
        assert_eq!(live.received, 1);
        let backlog = report.backlog.unwrap();
        assert_eq!(backlog.completed().unwrap().state, DrainState::Cancelled);
    }

    #[tokio::test]
    async fn test_backlog_unbinds_while_live_keeps_running() {
        let broker = MemoryBroker::new();
        let config = TopologyConfig::full("poc.messages");
        let shared = declare_topology(&broker, &config).await;
        let backlog = shared.backlog.unwrap();
        broker
            .publish("direct", "", Message::text("orphan"))
            .await
            .unwrap();

        let (backlog_handler, mut backlog_rx) = CountingHandler::with_channel();
        let (live_handler, mut live_rx) = CountingHandler::with_channel();
        let running = Supervisor::new(Arc::new(broker.clone()), config)
            .with_handlers(Arc::new(backlog_handler), Arc::new(live_handler))
            .start()
            .await
            .unwrap();
        let handle = running.shutdown_handle();
        let task = tokio::spawn(running.run_until(std::future::pending()));

        assert_eq!(recv(&mut backlog_rx).await, "orphan");
        broker.cancel_consumers(&backlog.queue);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!broker.is_bound(&backlog.queue, &backlog.exchange));

        broker
            .publish("direct", "", Message::text("hello"))
            .await
            .unwrap();
        assert_eq!(recv(&mut live_rx).await, "hello");

        handle.trigger();
        let report = task.await.unwrap();

        let drained = report.backlog.unwrap();
        let drained = drained.completed().unwrap();
        assert_eq!(drained.state, DrainState::Unbound);
        assert_eq!(drained.processed, 1);
        assert_eq!(report.live.completed().unwrap().exit, LiveExit::Cancelled);
        assert_eq!(broker.unbind_calls(), 1);
    }

    #[tokio::test]
    async fn test_unbind_failure_does_not_stop_live() {
        let broker = MemoryBroker::new();
        broker.set_fail_on_unbind(true);
        let (live_handler, mut live_rx) = CountingHandler::with_channel();

        let running = Supervisor::new(
            Arc::new(broker.clone()),
            TopologyConfig::with_alternate("poc.messages"),
        )
        .with_handlers(Arc::new(CountingHandler::new()), Arc::new(live_handler))
        .start()
        .await
        .unwrap();
        let backlog_queue = running.topology().backlog().unwrap().queue.clone();
        let handle = running.shutdown_handle();
        let task = tokio::spawn(running.run_until(std::future::pending()));

        broker.cancel_consumers(&backlog_queue);
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker
            .publish("poc.messages", "", Message::text("still here"))
            .await
            .unwrap();
        assert_eq!(recv(&mut live_rx).await, "still here");

        handle.trigger();
        let report = task.await.unwrap();

        let drained = report.backlog.unwrap();
        assert!(drained.completed().unwrap().unbind_error.is_some());
        assert_eq!(broker.unbind_calls(), 1);
        assert_eq!(report.live.completed().unwrap().received, 1);
    }

    #[tokio::test]
    async fn test_backlog_panic_is_reported() {
        let broker = MemoryBroker::new();
        let config = TopologyConfig::with_alternate("poc.messages");
        declare_topology(&broker, &config).await;
        broker
            .publish("poc.messages", "", Message::text("poison"))
            .await
            .unwrap();

        let running = Supervisor::new(Arc::new(broker.clone()), config)
            .with_handlers(Arc::new(PanickingHandler), Arc::new(CountingHandler::new()))
            .start()
            .await
            .unwrap();
        let handle = running.shutdown_handle();
        let task = tokio::spawn(running.run_until(std::future::pending()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.trigger();
        let report = task.await.unwrap();

        assert!(matches!(report.backlog, Some(TaskOutcome::Panicked(_))));
        assert!(report.live.completed().is_some());
    }

    #[tokio::test]
    async fn test_default_handlers_process_backlog_and_live() {
        let broker = MemoryBroker::new();
        let config = TopologyConfig::full("poc.messages");
        let backlog = declare_topology(&broker, &config).await.backlog.unwrap();
        broker
            .publish("direct", "", Message::text("orphan"))
            .await
            .unwrap();

        let running = Supervisor::new(Arc::new(broker.clone()), config)
            .start()
            .await
            .unwrap();
        let live_queue = running.topology().live_queue.clone();
        let handle = running.shutdown_handle();
        let task = tokio::spawn(running.run_until(std::future::pending()));

        broker
            .publish("direct", "", Message::new(vec![0xff, 0xfe]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.message_count(&backlog.queue), Some(0));
        assert_eq!(broker.message_count(&live_queue), Some(0));

        broker.cancel_consumers(&backlog.queue);
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.trigger();
        let report = task.await.unwrap();

        let drained = report.backlog.unwrap();
        let drained = drained.completed().unwrap();
        assert_eq!(drained.state, DrainState::Unbound);
        assert_eq!(drained.processed, 1);
        assert_eq!(report.live.completed().unwrap().received, 1);
    }

    #[tokio::test]
    async fn test_failed_signal_stops_consumers_and_returns_error() {
        let broker = MemoryBroker::new();
        let running = Supervisor::new(
            Arc::new(broker.clone()),
            TopologyConfig::full("poc.messages"),
        )
        .start()
        .await
        .unwrap();
        let live_queue = running.topology().live_queue.clone();

        let result = running
            .run_until_ok(async { Err::<(), _>("signal handler unavailable") })
            .await;

        assert_eq!(result.err(), Some("signal handler unavailable"));
        assert!(!broker.queue_exists(&live_queue));
    }

    #[tokio::test]
    async fn test_signal_ok_returns_report() {
        let running = Supervisor::new(
            Arc::new(MemoryBroker::new()),
            TopologyConfig::fanout_only("poc.messages"),
        )
        .start()
        .await
        .unwrap();

        let report = running
            .run_until_ok(async { Ok::<(), String>(()) })
            .await
            .unwrap();

        assert_eq!(report.live.completed().unwrap().exit, LiveExit::Cancelled);
    }

    #[tokio::test]
    async fn test_fanout_only_has_no_backlog_task() {
        let broker = MemoryBroker::new();
        let running = Supervisor::new(
            Arc::new(broker),
            TopologyConfig::fanout_only("poc.messages"),
        )
        .start()
        .await
        .unwrap();

        let report = running.run_until(async {}).await;

        assert!(report.backlog.is_none());
        assert_eq!(report.live.completed().unwrap().exit, LiveExit::Cancelled);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_spawns_nothing() {
        let broker = Arc::new(RecordingBroker::new(MemoryBroker::new()));
        broker.fail_on("bind_exchange direct");

        let result = Supervisor::new(broker.clone(), TopologyConfig::full("poc.messages"))
            .start()
            .await;

        let err = result.err().expect("start should fail");
        assert_eq!(err.step, BootstrapStep::BindDirectExchange);
        assert!(!broker.calls().iter().any(|c| c.starts_with("consume")));
    }

    #[tokio::test]
    async fn test_shutdown_closes_broker() {
        let broker = MemoryBroker::new();
        let running = Supervisor::new(
            Arc::new(broker.clone()),
            TopologyConfig::with_alternate("poc.messages"),
        )
        .start()
        .await
        .unwrap();
        let live_queue = running.topology().live_queue.clone();

        running.run_until(async {}).await;

        assert!(broker
            .declare_queue("after", Default::default())
            .await
            .is_err());
        assert!(!broker.queue_exists(&live_queue));
    }
}
