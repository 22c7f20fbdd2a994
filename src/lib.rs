//! Alternator - AMQP backlog-and-live messaging
//!
//! Declares a fanout topology whose primary exchange falls back to an
//! alternate exchange when no subscriber is bound. Messages published while
//! nobody listens accumulate in a shared backlog queue. Each subscriber
//! drains that backlog once, unbinds it, and keeps consuming its own live
//! queue.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod publisher;
pub mod supervisor;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod topology;
pub mod utils;
