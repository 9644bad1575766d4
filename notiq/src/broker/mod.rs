//! Broker sessions and connection management.
//!
//! The broker is reached through two seams:
//! - [`Connector`] performs a single connection attempt
//! - [`QueueSession`] is one live session: declare, publish, receive, settle
//!
//! [`ConnectionManager`] wraps a connector with bounded retry and exponential
//! backoff. Implementations:
//! - [`redis_streams::RedisConnector`] - Redis Streams with consumer groups
//! - [`memory::MemoryBroker`] - in-process broker with the same semantics

pub mod connection;
pub mod memory;
pub mod redis_streams;

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

pub use connection::{ConnectionManager, RetryPolicy};

/// Content type attached to every published notification.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Default queue name.
pub const DEFAULT_QUEUE: &str = "notifications";

/// A message about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    /// Survives a broker restart.
    pub persistent: bool,
}

impl OutgoingMessage {
    /// A persistent JSON message.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: JSON_CONTENT_TYPE.to_string(),
            persistent: true,
        }
    }
}

/// A message handed to a consumer, pending acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned tag used to settle this delivery.
    pub tag: String,
    pub queue: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// How many times this message has been delivered, including this one.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Performs one connection attempt to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: QueueSession;

    /// Human-readable broker location for logs.
    fn describe(&self) -> String;

    /// Open a new session. Errors are treated as connection failures and retried
    /// by [`ConnectionManager`].
    async fn open(&self) -> Result<Self::Session>;
}

/// One live broker session.
#[async_trait]
pub trait QueueSession: Send {
    /// Create the queue if it does not exist. Idempotent; the queue is durable.
    async fn declare_queue(&mut self, queue: &str) -> Result<()>;

    /// Limit the number of unacknowledged deliveries held by this session.
    async fn set_prefetch(&mut self, count: u16) -> Result<()>;

    /// Publish a message to the queue.
    async fn publish(&mut self, queue: &str, message: OutgoingMessage) -> Result<()>;

    /// Wait up to `wait` for the next delivery. Returns `None` on timeout or when
    /// the prefetch window is full.
    async fn receive(&mut self, queue: &str, wait: Duration) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery, removing the message permanently.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Reject a delivery. With `requeue` the broker delivers it again later;
    /// without, the message is discarded.
    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&mut self) -> Result<()>;
}
