//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod broker;

pub use broker::BrokerConfig;

use serde::Deserialize;

use crate::publisher::PublisherConfig;
use crate::topology::TopologyConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "alternator.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ALTERNATOR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ALTERNATOR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ALTERNATOR_LOG";

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub broker: BrokerConfig,
    /// Exchange and queue topology.
    pub topology: TopologyConfig,
    /// Publisher role settings.
    pub publisher: PublisherConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `DEFAULT_CONFIG_FILE` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a valid topology.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.name.is_empty() {
            return Err(ConfigError::Invalid("topology.name must not be empty".into()));
        }
        if let Some(direct) = &self.topology.direct_exchange {
            if direct.is_empty() || *direct == self.topology.name {
                return Err(ConfigError::Invalid(format!(
                    "topology.direct_exchange '{}' must be non-empty and differ from topology.name",
                    direct
                )));
            }
        }
        if self.broker.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "broker.connect_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
