//! Message consumers.
//!
//! This module contains:
//! - `MessageHandler` trait: processing callback for delivered messages
//! - `LogHandler`: logs each message body
//! - `BacklogConsumer`: drains the backlog queue, then unbinds it
//! - `LiveConsumer`: consumes the instance's live queue
//!
//! Both consumers auto-acknowledge. A handler error is logged and the message
//! is not redelivered.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use crate::broker::Message;

pub mod backlog;
pub mod live;

pub use backlog::{BacklogConsumer, DrainReport, DrainState};
pub use live::{LiveConsumer, LiveExit, LiveReport};

/// Error returned by a message handler.
#[derive(Debug, thiserror::Error)]
#[error("Handler failed: {0}")]
pub struct HandlerError(pub String);

/// Handler for delivered messages.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, Result<(), HandlerError>>;
}

/// Logs every message body at info level.
pub struct LogHandler {
    label: &'static str,
}

impl LogHandler {
    /// Handler for the backlog stream.
    pub fn pending() -> Self {
        Self {
            label: "Processing pending message",
        }
    }

    /// Handler for the live stream.
    pub fn received() -> Self {
        Self {
            label: "Received a message",
        }
    }
}

impl MessageHandler for LogHandler {
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let label = self.label;
        Box::pin(async move {
            info!(
                body = %message.body_lossy(),
                content_type = ?message.content_type,
                "{}",
                label
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_handlers_accept_text() {
        let message = Arc::new(Message::text("hello"));

        assert!(LogHandler::pending().handle(message.clone()).await.is_ok());
        assert!(LogHandler::received().handle(message).await.is_ok());
    }

    #[tokio::test]
    async fn test_log_handler_accepts_invalid_utf8() {
        let message = Arc::new(Message::new(vec![0x66, 0xff, 0xfe, 0x6f]));
        assert_eq!(message.body_lossy(), "f\u{fffd}\u{fffd}o");

        assert!(LogHandler::pending().handle(message.clone()).await.is_ok());
        assert!(LogHandler::received().handle(message).await.is_ok());
    }

    #[test]
    fn test_log_handler_labels() {
        assert_eq!(LogHandler::pending().label, "Processing pending message");
        assert_eq!(LogHandler::received().label, "Received a message");
    }
}
