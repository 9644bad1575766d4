//! notiq: queue-backed notification service.
//!
//! Notifications accepted over HTTP are published to a durable queue and
//! delivered asynchronously by a worker with at-least-once semantics.

pub mod api;
pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod notifier;
pub mod producer;
pub mod worker;

pub use error::{Error, Result};
