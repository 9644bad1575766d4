//! Long-lived consumer loop driving the acknowledgment state machine.

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatcher::{Dispatcher, Disposition};
use crate::broker::{
    ConnectionManager, Connector, Delivery, OutgoingMessage, QueueSession, RetryPolicy,
};
use crate::config::{Lookup, parsed_var, string_var};
use crate::notifier::Notifier;
use crate::{Error, Result};

/// Consumer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Upper bound on a single receive wait. Cancellation is noticed at most
    /// this long after it is requested while idle.
    pub poll_interval: Duration,
    /// Unacknowledged-message limit for the session.
    pub prefetch: u16,
    /// Dead-letter a message instead of requeueing it once it has been
    /// delivered this many times. `None` requeues forever.
    pub max_deliveries: Option<u32>,
    /// Defaults to `<queue>.dead-letter`.
    pub dead_letter_queue: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            prefetch: 1,
            max_deliveries: None,
            dead_letter_queue: None,
        }
    }
}

impl ConsumerConfig {
    /// Supported keys: `WORKER_POLL_INTERVAL_MS`, `WORKER_MAX_DELIVERIES`
    /// (`0` disables the cap), `WORKER_DEAD_LETTER_QUEUE`.
    pub fn from_lookup(lookup: &impl Lookup) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parsed_var::<u64>(lookup, "WORKER_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms.max(1));
        }
        config.max_deliveries =
            parsed_var::<u32>(lookup, "WORKER_MAX_DELIVERIES").filter(|n| *n > 0);
        config.dead_letter_queue = string_var(lookup, "WORKER_DEAD_LETTER_QUEUE");

        config
    }
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub acknowledged: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Acknowledge => self.acknowledged += 1,
            Disposition::RejectAndRequeue => self.requeued += 1,
            Disposition::RejectAndDrop => self.dropped += 1,
        }
    }
}

/// Receives messages one at a time and settles each according to the
/// dispatcher's verdict before accepting the next.
pub struct ConsumerLoop<C: Connector, N> {
    manager: ConnectionManager<C>,
    dispatcher: Dispatcher<N>,
    queue: String,
    dead_letter_queue: String,
    config: ConsumerConfig,
    stats: ConsumerStats,
}

impl<C: Connector, N: Notifier> ConsumerLoop<C, N> {
    pub fn new(
        connector: C,
        queue: impl Into<String>,
        notifier: N,
        config: ConsumerConfig,
    ) -> Self {
        let queue = queue.into();
        let dead_letter_queue = config
            .dead_letter_queue
            .clone()
            .unwrap_or_else(|| format!("{}.dead-letter", queue));
        let manager =
            ConnectionManager::new(connector, queue.clone()).with_prefetch(config.prefetch);

        Self {
            manager,
            dispatcher: Dispatcher::new(notifier),
            queue,
            dead_letter_queue,
            config,
            stats: ConsumerStats::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.manager = self.manager.with_policy(policy);
        self
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter_queue
    }

    /// Consume until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// Connection exhaustion is fatal, both at startup and when a lost session
    /// cannot be re-established.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<ConsumerStats> {
        self.manager.connect().await?;
        info!(queue = %self.queue, "Starting to consume messages from queue");
        info!("Waiting for notifications. To exit press CTRL+C");

        let outcome = loop {
            if shutdown.is_cancelled() {
                info!("Interrupted, shutting down...");
                break Ok(());
            }

            match self.step().await {
                Ok(()) => {}
                Err(e) if e.is_connection_lost() => {
                    warn!(error = %e, "Lost broker session, reconnecting");
                    if let Err(e) = self.manager.reconnect().await {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = self.manager.close().await {
            warn!(error = %e, "Error while closing broker session");
        }

        let stats = self.stats;
        match outcome {
            Ok(()) => {
                info!(
                    received = stats.received,
                    acknowledged = stats.acknowledged,
                    requeued = stats.requeued,
                    dropped = stats.dropped,
                    dead_lettered = stats.dead_lettered,
                    "Worker stopped"
                );
                Ok(stats)
            }
            Err(e) => {
                error!(error = %e, "Error consuming messages");
                Err(e)
            }
        }
    }

    /// One iteration: wait for a delivery, process it, settle it.
    async fn step(&mut self) -> Result<()> {
        let session = self.manager.connect().await?;
        let Some(delivery) = session.receive(&self.queue, self.config.poll_interval).await? else {
            return Ok(());
        };

        self.stats.received += 1;
        debug!(
            tag = %delivery.tag,
            delivery_count = delivery.delivery_count,
            redelivered = delivery.redelivered(),
            "Message received"
        );

        let disposition = self.dispatcher.process(&delivery.body).await;
        self.settle(&delivery, disposition).await
    }

    async fn settle(&mut self, delivery: &Delivery, disposition: Disposition) -> Result<()> {
        // Tags are only valid on the session that received them.
        let session = self
            .manager
            .session()
            .filter(|s| s.is_open())
            .ok_or(Error::NotConnected)?;

        match disposition {
            Disposition::Acknowledge => session.ack(delivery).await?,
            Disposition::RejectAndDrop => session.reject(delivery, false).await?,
            Disposition::RejectAndRequeue => {
                if let Some(max) = self.config.max_deliveries
                    && delivery.delivery_count >= max
                {
                    session.declare_queue(&self.dead_letter_queue).await?;
                    session
                        .publish(
                            &self.dead_letter_queue,
                            OutgoingMessage::json(delivery.body.clone()),
                        )
                        .await?;
                    session.reject(delivery, false).await?;

                    warn!(
                        tag = %delivery.tag,
                        deliveries = delivery.delivery_count,
                        dead_letter_queue = %self.dead_letter_queue,
                        "Delivery limit reached, message dead-lettered"
                    );
                    self.stats.dead_lettered += 1;
                    return Ok(());
                }
                session.reject(delivery, true).await?;
            }
        }

        debug!(tag = %delivery.tag, disposition = %disposition, "Message settled");
        self.stats.record(disposition);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::config::tests::lookup;
    use crate::domain::{NewNotification, Notification, Priority};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::task::JoinHandle;

    const QUEUE: &str = "notifications";

    #[derive(Default)]
    struct FailingNotifier {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Notifier for FailingNotifier {
        fn channel_type(&self) -> &'static str {
            "failing"
        }

        async fn send(&self, _notification: &Notification) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::email("535 authentication failed"))
        }
    }

    fn high_priority() -> Vec<u8> {
        Notification::new(NewNotification {
            subject: "S".to_string(),
            message: "M".to_string(),
            recipients: vec!["a@b.com".to_string()],
            priority: Priority::High,
        })
        .to_body()
        .unwrap()
    }

    fn config(max_deliveries: Option<u32>) -> ConsumerConfig {
        ConsumerConfig {
            poll_interval: Duration::from_millis(10),
            max_deliveries,
            ..Default::default()
        }
    }

    fn spawn(
        broker: &MemoryBroker,
        notifier: Arc<FailingNotifier>,
        config: ConsumerConfig,
        shutdown: CancellationToken,
    ) -> JoinHandle<Result<ConsumerStats>> {
        let consumer = ConsumerLoop::new(broker.clone(), QUEUE, notifier, config)
            .with_policy(RetryPolicy::with_unit(Duration::from_millis(1)));
        tokio::spawn(consumer.run(shutdown))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_consumer_config_from_lookup() {
        let config = ConsumerConfig::from_lookup(&lookup(&[
            ("WORKER_POLL_INTERVAL_MS", "250"),
            ("WORKER_MAX_DELIVERIES", "3"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.prefetch, 1);
        assert_eq!(config.max_deliveries, Some(3));

        let disabled = ConsumerConfig::from_lookup(&lookup(&[("WORKER_MAX_DELIVERIES", "0")]));
        assert_eq!(disabled.max_deliveries, None);
    }

    #[test]
    fn test_dead_letter_queue_name() {
        let consumer = ConsumerLoop::new(
            MemoryBroker::new(),
            "alerts",
            Arc::new(FailingNotifier::default()),
            ConsumerConfig::default(),
        );
        assert_eq!(consumer.dead_letter_queue(), "alerts.dead-letter");
    }

    #[tokio::test]
    async fn test_startup_connection_exhaustion_is_fatal() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(10);

        let result = spawn(
            &broker,
            Arc::default(),
            config(None),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(Error::ConnectionExhausted { attempts: 5 })));
        assert_eq!(broker.connect_attempts(), 5);
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_loop() {
        let broker = MemoryBroker::new();
        let shutdown = CancellationToken::new();
        let handle = spawn(&broker, Arc::default(), config(None), shutdown.clone());

        wait_until(|| broker.queue_exists(QUEUE)).await;
        shutdown.cancel();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats, ConsumerStats::default());
    }

    #[tokio::test]
    async fn test_failing_delivery_is_requeued_until_cap() {
        let broker = MemoryBroker::new();
        let notifier = Arc::new(FailingNotifier::default());
        let shutdown = CancellationToken::new();
        broker.inject(QUEUE, high_priority());

        let handle = spawn(&broker, notifier.clone(), config(Some(3)), shutdown.clone());
        wait_until(|| broker.ready_count("notifications.dead-letter") == 1).await;
        shutdown.cancel();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.received, 3);
        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(broker.ready_count(QUEUE), 0);
        assert_eq!(broker.unacked_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_lost_session_is_reestablished() {
        let broker = MemoryBroker::new();
        let shutdown = CancellationToken::new();
        let handle = spawn(&broker, Arc::default(), config(None), shutdown.clone());

        wait_until(|| broker.connect_attempts() == 1).await;
        broker.sever_connections();
        wait_until(|| broker.connect_attempts() == 2).await;

        broker.inject(
            QUEUE,
            Notification::new(NewNotification {
                subject: "S".to_string(),
                message: "M".to_string(),
                recipients: vec!["a@b.com".to_string()],
                priority: Priority::Low,
            })
            .to_body()
            .unwrap(),
        );
        wait_until(|| broker.ready_count(QUEUE) == 0 && broker.unacked_count(QUEUE) == 0).await;
        shutdown.cancel();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.acknowledged, 1);
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_is_fatal() {
        let broker = MemoryBroker::new();
        let handle = spawn(
            &broker,
            Arc::default(),
            config(None),
            CancellationToken::new(),
        );

        wait_until(|| broker.connect_attempts() == 1).await;
        broker.fail_next_connects(5);
        broker.sever_connections();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionExhausted { attempts: 5 })));
        assert_eq!(broker.connect_attempts(), 6);
    }
}
