//! alternator-subscriber: Backlog and live consumer
//!
//! Declares the topology, drains messages that arrived while no subscriber
//! was bound, then logs live messages until interrupted.
//!
//! ## Architecture
//! ```text
//! [direct] --> [poc.messages] --> [<uuid>@poc.messages] --> live consumer
//!                    |
//!                    | (unroutable)
//!                    v
//!          [poc.messages-alternate] --> [alternate@poc.messages-alternate] --> backlog consumer
//! ```
//!
//! ## Configuration
//! - alternator.yaml or ALTERNATOR_CONFIG: configuration file
//! - ALTERNATOR__BROKER__URL: broker URL override
//! - ALTERNATOR_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use alternator::broker::AmqpBroker;
use alternator::config::Config;
use alternator::supervisor::Supervisor;
use alternator::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let broker =
        connect_with_retry(&config.broker, || AmqpBroker::connect(&config.broker.url)).await?;

    let running = match Supervisor::new(Arc::new(broker), config.topology).start().await {
        Ok(running) => running,
        Err(e) => {
            error!(error = %e, "Topology bootstrap failed");
            std::process::exit(1);
        }
    };

    info!(
        queue = %running.topology().live_queue,
        "alternator-subscriber started, press Ctrl+C to exit"
    );

    match running.run_until_ok(tokio::signal::ctrl_c()).await {
        Ok(report) => {
            info!(?report, "alternator-subscriber stopped");
            Ok(())
        }
        Err(_) => std::process::exit(1),
    }
}
