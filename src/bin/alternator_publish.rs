//! alternator-publish: Send one message
//!
//! Publishes its single argument to the topology's entry exchange.
//!
//! ## Configuration
//! Same sources as alternator-subscriber; the `publisher` section sets the
//! routing key and content type.

use std::sync::Arc;

use alternator::broker::{AmqpBroker, Broker};
use alternator::config::Config;
use alternator::publisher::Publisher;
use alternator::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let message = match (args.next(), args.next()) {
        (Some(message), None) => message,
        _ => {
            eprintln!("Usage: alternator-publish MSG");
            std::process::exit(1);
        }
    };

    init_tracing();

    let config = Config::load(None)?;
    let broker: Arc<dyn Broker> = Arc::new(
        connect_with_retry(&config.broker, || AmqpBroker::connect(&config.broker.url)).await?,
    );

    let publisher = Publisher::new(broker.clone(), &config.topology, config.publisher);
    publisher.publish(message).await?;
    broker.close().await?;

    Ok(())
}
