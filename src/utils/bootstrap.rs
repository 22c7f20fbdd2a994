//! Bootstrap utilities for alternator binaries.
//!
//! Shared initialization code for the subscriber and publisher.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{BrokerConfig, LOG_ENV_VAR};

/// Initialize tracing with the ALTERNATOR_LOG environment variable.
///
/// Defaults to "info" level if ALTERNATOR_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to the broker with exponential backoff.
///
/// Makes at most `config.connect_attempts` attempts and returns the last
/// error once they are exhausted.
pub async fn connect_with_retry<T, E, F, Fut>(config: &BrokerConfig, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.connect_attempts.max(1);
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(config.connect_max_delay())
        .with_max_times(max_attempts - 1)
        .with_jitter()
        .build();

    let mut attempt = 1;
    let mut result = connect().await;
    for delay in backoff {
        match &result {
            Ok(_) => break,
            Err(e) => warn!(
                attempt,
                max_attempts,
                error = %e,
                backoff_ms = %delay.as_millis(),
                "Failed to connect to broker, retrying..."
            ),
        }
        tokio::time::sleep(delay).await;
        attempt += 1;
        result = connect().await;
    }

    match &result {
        Ok(_) => info!(attempt, "Connected to broker"),
        Err(e) => error!(attempts = attempt, error = %e, "Failed to connect to broker"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick_config(attempts: usize) -> BrokerConfig {
        BrokerConfig {
            connect_attempts: attempts,
            connect_max_delay_ms: 1,
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_succeeds_after_failures() {
        let calls = AtomicUsize::new(0);

        let result: Result<&str, String> = connect_with_retry(&quick_config(5), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("connection refused".to_string())
            } else {
                Ok("connected")
            }
        })
        .await;

        assert_eq!(result, Ok("connected"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_attempts() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), String> = connect_with_retry(&quick_config(3), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("connection refused".to_string())
        })
        .await;

        assert_eq!(result, Err("connection refused".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_attempt_does_not_retry() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), String> = connect_with_retry(&quick_config(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
