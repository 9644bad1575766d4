//! In-process broker.
//!
//! Mirrors the delivery semantics the consumer relies on: durable named queues,
//! a per-session prefetch window, explicit ack/reject, redelivery of rejected
//! messages, and redelivery of a session's unacknowledged messages when the
//! session closes. Used by `notiq standalone` and by tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use super::{Connector, Delivery, OutgoingMessage, QueueSession};
use crate::{Error, Result};

/// A message stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
    /// Number of times the message has been handed to a consumer.
    pub deliveries: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (u64, StoredMessage)>,
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    next_tag: AtomicU64,
    next_session: AtomicU64,
    epoch: AtomicU64,
    fail_connects: AtomicU32,
    connects: AtomicU32,
}

/// Handle to an in-process broker. Clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Drop every open session, as a broker restart would. Unacknowledged
    /// messages return to their queues.
    pub fn sever_connections(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let mut queues = self.shared.queues.lock();
        for state in queues.values_mut() {
            let unacked = std::mem::take(&mut state.unacked);
            let mut held: Vec<_> = unacked.into_iter().collect();
            held.sort_by_key(|(tag, _)| *tag);
            state.ready.extend(held.into_iter().map(|(_, (_, message))| message));
        }
        drop(queues);
        self.shared.notify.notify_waiters();
    }

    /// Number of connection attempts seen, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.queues.lock().contains_key(queue)
    }

    /// Messages waiting for delivery.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Snapshot of messages waiting for delivery, oldest first.
    pub fn ready_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.shared
            .queues
            .lock()
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Enqueue a raw body, bypassing any producer.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.push(
            queue,
            StoredMessage {
                body: body.into(),
                content_type: super::JSON_CONTENT_TYPE.to_string(),
                persistent: true,
                deliveries: 0,
            },
        );
    }

    fn push(&self, queue: &str, message: StoredMessage) {
        self.shared
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(message);
        self.shared.notify.notify_waiters();
    }

    fn take(&self, queue: &str, session: u64) -> Option<Delivery> {
        let mut queues = self.shared.queues.lock();
        let state = queues.get_mut(queue)?;
        let mut message = state.ready.pop_front()?;
        message.deliveries += 1;

        let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let delivery = Delivery {
            tag: tag.to_string(),
            queue: queue.to_string(),
            body: message.body.clone(),
            content_type: Some(message.content_type.clone()),
            delivery_count: message.deliveries,
        };
        state.unacked.insert(tag, (session, message));
        Some(delivery)
    }

    fn settle(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let tag: u64 = delivery
            .tag
            .parse()
            .map_err(|_| Error::Other(format!("unknown delivery tag {}", delivery.tag)))?;

        let mut queues = self.shared.queues.lock();
        let state = queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| Error::Other(format!("unknown queue {}", delivery.queue)))?;
        let (_, message) = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| Error::Other(format!("unknown delivery tag {}", tag)))?;

        if requeue {
            state.ready.push_back(message);
            drop(queues);
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }

    /// Return every unacknowledged message held by `session` to its queue.
    fn release_session(&self, session: u64) -> usize {
        let mut released = 0;
        let mut queues = self.shared.queues.lock();
        for state in queues.values_mut() {
            let tags: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == session)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags {
                if let Some((_, message)) = state.unacked.remove(&tag) {
                    state.ready.push_back(message);
                    released += 1;
                }
            }
        }
        drop(queues);
        if released > 0 {
            self.shared.notify.notify_waiters();
        }
        released
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Session = MemorySession;

    fn describe(&self) -> String {
        "memory://".to_string()
    }

    async fn open(&self) -> Result<MemorySession> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .shared
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::connection("memory broker refused connection"));
        }

        let id = self.shared.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(session = id, "Memory broker session opened");
        Ok(MemorySession {
            broker: self.clone(),
            id,
            epoch: self.shared.epoch.load(Ordering::SeqCst),
            open: true,
            prefetch: None,
            in_flight: HashSet::new(),
        })
    }
}

/// A session on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemorySession {
    broker: MemoryBroker,
    id: u64,
    epoch: u64,
    open: bool,
    prefetch: Option<u16>,
    in_flight: HashSet<String>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn window_full(&self) -> bool {
        self.prefetch
            .is_some_and(|limit| self.in_flight.len() >= usize::from(limit))
    }
}

impl Drop for MemorySession {
    // A dropped connection returns its unacknowledged messages, as a real
    // broker does when a consumer disappears.
    fn drop(&mut self) {
        if self.open {
            self.broker.release_session(self.id);
        }
    }
}

#[async_trait]
impl QueueSession for MemorySession {
    async fn declare_queue(&mut self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .shared
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch = (count > 0).then_some(count);
        Ok(())
    }

    async fn publish(&mut self, queue: &str, message: OutgoingMessage) -> Result<()> {
        self.ensure_open()?;
        self.broker.push(
            queue,
            StoredMessage {
                body: message.body,
                content_type: message.content_type,
                persistent: message.persistent,
                deliveries: 0,
            },
        );
        Ok(())
    }

    async fn receive(&mut self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        if self.window_full() {
            trace!(session = self.id, "Prefetch window full, withholding delivery");
            return Ok(None);
        }

        let deadline = Instant::now() + wait;
        loop {
            let notified = self.broker.shared.notify.notified();
            self.ensure_open()?;
            if let Some(delivery) = self.broker.take(queue, self.id) {
                self.in_flight.insert(delivery.tag.clone());
                return Ok(Some(delivery));
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.ensure_open()?;
        self.broker.settle(delivery, false)?;
        self.in_flight.remove(&delivery.tag);
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker.settle(delivery, requeue)?;
        self.in_flight.remove(&delivery.tag);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open && self.epoch == self.broker.shared.epoch.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            let released = self.broker.release_session(self.id);
            self.in_flight.clear();
            debug!(session = self.id, released, "Memory broker session closed");
        }
        Ok(())
    }
}
