//! Topology bootstrap.
//!
//! Declares the exchange chain in dependency order:
//!
//! ```text
//! publisher --> direct --[exchange bind]--> primary (fanout) --> live queue
//!                                              \--(unroutable)--> alternate (fanout) --> backlog queue
//! ```
//!
//! The alternate exchange must exist before the primary exchange names it, and
//! the backlog queue must be bound before the primary exchange can start
//! diverting unroutable messages into it.

use std::fmt;

use serde::Deserialize;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerError, ExchangeKind, ExchangeOptions, QueueOptions};


/// Separator between the parts of a derived queue name.
pub const NAME_SEPARATOR: &str = "@";
/// Prefix of the backlog queue name.
pub const BACKLOG_QUEUE_PREFIX: &str = "alternate";
/// Suffix appended to the primary exchange name to form the alternate exchange.
pub const ALTERNATE_EXCHANGE_SUFFIX: &str = "-alternate";
/// Default topology name.
pub const DEFAULT_TOPOLOGY_NAME: &str = "poc.messages";
/// Default direct entry exchange.
pub const DEFAULT_DIRECT_EXCHANGE: &str = "direct";

/// Every binding in this topology uses the empty key.
const BINDING_KEY: &str = "";

// ============================================================================
// Naming
// ============================================================================

/// Alternate exchange for a primary exchange.
pub fn alternate_exchange_name(primary_exchange: &str) -> String {
    format!("{}{}", primary_exchange, ALTERNATE_EXCHANGE_SUFFIX)
}

/// Durable backlog queue for an alternate exchange.
///
/// Deterministic, so every restart reuses the same backlog.
pub fn backlog_queue_name(alternate_exchange: &str) -> String {
    format!(
        "{}{}{}",
        BACKLOG_QUEUE_PREFIX, NAME_SEPARATOR, alternate_exchange
    )
}

/// Ephemeral live queue for one subscriber instance.
pub fn live_queue_name(primary_exchange: &str) -> String {
    format!("{}{}{}", uuid::Uuid::new_v4(), NAME_SEPARATOR, primary_exchange)
}

// ============================================================================
// Configuration
// ============================================================================

/// Topology configuration.
///
/// Selects which stages are declared. The named constructors are the
/// supported profiles.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Primary (fanout) exchange name.
    pub name: String,
    /// Direct entry exchange routing into the primary exchange.
    pub direct_exchange: Option<String>,
    /// Declare the alternate exchange and backlog queue.
    pub alternate: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self::full(DEFAULT_TOPOLOGY_NAME)
    }
}

impl TopologyConfig {
    /// Fanout exchange and live queue only. Unroutable messages are dropped.
    pub fn fanout_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direct_exchange: None,
            alternate: false,
        }
    }

    /// Fanout exchange with alternate-exchange backlog.
    pub fn with_alternate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direct_exchange: None,
            alternate: true,
        }
    }

    /// Direct entry exchange, fanout exchange and alternate-exchange backlog.
    pub fn full(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direct_exchange: Some(DEFAULT_DIRECT_EXCHANGE.to_string()),
            alternate: true,
        }
    }

    pub fn with_direct_exchange(mut self, direct_exchange: impl Into<String>) -> Self {
        self.direct_exchange = Some(direct_exchange.into());
        self
    }

    pub fn primary_exchange(&self) -> &str {
        &self.name
    }

    pub fn alternate_exchange(&self) -> Option<String> {
        self.alternate.then(|| alternate_exchange_name(&self.name))
    }

    pub fn backlog_queue(&self) -> Option<String> {
        self.alternate_exchange()
            .map(|exchange| backlog_queue_name(&exchange))
    }

    /// Exchange publishers target: the direct exchange if present.
    pub fn entry_exchange(&self) -> &str {
        self.direct_exchange.as_deref().unwrap_or(&self.name)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Bootstrap step, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    DeclareAlternateExchange,
    DeclareBacklogQueue,
    BindBacklogQueue,
    DeclarePrimaryExchange,
    DeclareDirectExchange,
    BindDirectExchange,
    DeclareLiveQueue,
    BindLiveQueue,
    ConsumeBacklogQueue,
    ConsumeLiveQueue,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BootstrapStep::DeclareAlternateExchange => "declare the alternate exchange",
            BootstrapStep::DeclareBacklogQueue => "declare the alternate queue",
            BootstrapStep::BindBacklogQueue => "bind the alternate queue",
            BootstrapStep::DeclarePrimaryExchange => "declare the exchange",
            BootstrapStep::DeclareDirectExchange => "declare the direct exchange",
            BootstrapStep::BindDirectExchange => "bind the direct exchange",
            BootstrapStep::DeclareLiveQueue => "declare the queue",
            BootstrapStep::BindLiveQueue => "bind the queue",
            BootstrapStep::ConsumeBacklogQueue => "register a consumer to alternate queue",
            BootstrapStep::ConsumeLiveQueue => "register a consumer to queue",
        };
        f.write_str(text)
    }
}

/// A bootstrap step failed. The topology is incomplete and must not be used.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to {step} {resource}: {source}")]
pub struct TopologyError {
    pub step: BootstrapStep,
    /// Exchange or queue the step acted on.
    pub resource: String,
    #[source]
    pub source: BrokerError,
}

impl TopologyError {
    pub fn new(step: BootstrapStep, resource: impl Into<String>, source: BrokerError) -> Self {
        Self {
            step,
            resource: resource.into(),
            source,
        }
    }

    /// Closure for `map_err` that tags a broker error with its step.
    pub fn at(step: BootstrapStep, resource: &str) -> impl FnOnce(BrokerError) -> Self + '_ {
        move |source| Self::new(step, resource, source)
    }
}

pub type Result<T> = std::result::Result<T, TopologyError>;

// ============================================================================
// Builder
// ============================================================================

/// Backlog exchange and queue pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backlog {
    pub exchange: String,
    pub queue: String,
}

/// Exchanges and durable queues shared by every subscriber instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedTopology {
    pub primary_exchange: String,
    pub direct_exchange: Option<String>,
    pub backlog: Option<Backlog>,
}

/// Full topology for one subscriber instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub shared: SharedTopology,
    pub live_queue: String,
}

impl Topology {
    pub fn primary_exchange(&self) -> &str {
        &self.shared.primary_exchange
    }

    pub fn backlog(&self) -> Option<&Backlog> {
        self.shared.backlog.as_ref()
    }
}

/// Resource named by a failed bind step.
fn binding(source: &str, exchange: &str) -> String {
    format!("{} to exchange {}", source, exchange)
}

/// Declares a topology on a broker.
pub struct TopologyBuilder<'a> {
    broker: &'a dyn Broker,
    config: &'a TopologyConfig,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(broker: &'a dyn Broker, config: &'a TopologyConfig) -> Self {
        Self { broker, config }
    }

    /// Declare everything, ending with this instance's live queue.
    pub async fn bootstrap(&self) -> Result<Topology> {
        let shared = self.declare_shared().await?;
        let live_queue = self.declare_live_queue(&shared).await?;

        info!(
            queue = %live_queue,
            exchange = %shared.primary_exchange,
            "Queue bound to exchange"
        );

        Ok(Topology { shared, live_queue })
    }

    /// Declare the alternate exchange and backlog queue, the primary exchange
    /// and the direct entry exchange, in that order.
    pub async fn declare_shared(&self) -> Result<SharedTopology> {
        let primary = self.config.primary_exchange();

        let backlog = match self.config.alternate_exchange() {
            Some(alternate) => Some(self.declare_backlog(alternate).await?),
            None => None,
        };

        self.broker
            .declare_exchange(
                primary,
                ExchangeKind::Fanout,
                ExchangeOptions {
                    durable: true,
                    alternate_exchange: backlog.as_ref().map(|b| b.exchange.clone()),
                },
            )
            .await
            .map_err(TopologyError::at(BootstrapStep::DeclarePrimaryExchange, primary))?;
        debug!(exchange = %primary, "Primary exchange declared");

        let direct_exchange = match &self.config.direct_exchange {
            Some(direct) => {
                self.declare_direct(direct, primary).await?;
                Some(direct.clone())
            }
            None => None,
        };

        Ok(SharedTopology {
            primary_exchange: primary.to_string(),
            direct_exchange,
            backlog,
        })
    }

    /// Declare a uniquely named, auto-delete queue bound to the primary exchange.
    pub async fn declare_live_queue(&self, shared: &SharedTopology) -> Result<String> {
        let requested = live_queue_name(&shared.primary_exchange);

        let queue = self
            .broker
            .declare_queue(
                &requested,
                QueueOptions {
                    durable: false,
                    auto_delete: true,
                },
            )
            .await
            .map_err(TopologyError::at(BootstrapStep::DeclareLiveQueue, &requested))?;

        self.broker
            .bind_queue(&queue, &shared.primary_exchange, BINDING_KEY)
            .await
            .map_err(|e| {
                TopologyError::new(
                    BootstrapStep::BindLiveQueue,
                    binding(&queue, &shared.primary_exchange),
                    e,
                )
            })?;

        Ok(queue)
    }

    async fn declare_backlog(&self, alternate: String) -> Result<Backlog> {
        self.broker
            .declare_exchange(
                &alternate,
                ExchangeKind::Fanout,
                ExchangeOptions {
                    durable: true,
                    alternate_exchange: None,
                },
            )
            .await
            .map_err(TopologyError::at(
                BootstrapStep::DeclareAlternateExchange,
                &alternate,
            ))?;

        let requested = backlog_queue_name(&alternate);
        let queue = self
            .broker
            .declare_queue(
                &requested,
                QueueOptions {
                    durable: true,
                    auto_delete: false,
                },
            )
            .await
            .map_err(TopologyError::at(BootstrapStep::DeclareBacklogQueue, &requested))?;

        self.broker
            .bind_queue(&queue, &alternate, BINDING_KEY)
            .await
            .map_err(|e| {
                TopologyError::new(BootstrapStep::BindBacklogQueue, binding(&queue, &alternate), e)
            })?;

        debug!(queue = %queue, exchange = %alternate, "Backlog queue bound");

        Ok(Backlog {
            exchange: alternate,
            queue,
        })
    }

    async fn declare_direct(&self, direct: &str, primary: &str) -> Result<()> {
        self.broker
            .declare_exchange(
                direct,
                ExchangeKind::Direct,
                ExchangeOptions {
                    durable: true,
                    alternate_exchange: None,
                },
            )
            .await
            .map_err(TopologyError::at(BootstrapStep::DeclareDirectExchange, direct))?;

        self.broker
            .bind_exchange(primary, direct, BINDING_KEY)
            .await
            .map_err(|e| {
                TopologyError::new(BootstrapStep::BindDirectExchange, binding(direct, primary), e)
            })?;

        debug!(source = %direct, destination = %primary, "Direct exchange bound");
        Ok(())
    }
}
