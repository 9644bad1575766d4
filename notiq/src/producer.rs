//! Publishing notifications to the queue.

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::Result;
use crate::broker::{ConnectionManager, Connector, OutgoingMessage, QueueSession, RetryPolicy};
use crate::domain::Notification;

/// Anything that can accept a notification into the queue.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Returns once the broker has accepted the message. Says nothing about
    /// whether it has been processed.
    async fn publish(&self, notification: &Notification) -> Result<()>;
}

/// Publishes each notification over its own short-lived session.
#[derive(Debug, Clone)]
pub struct Producer<C> {
    connector: C,
    queue: String,
    policy: RetryPolicy,
}

impl<C: Connector + Clone> Producer<C> {
    pub fn new(connector: C, queue: impl Into<String>) -> Self {
        Self {
            connector,
            queue: queue.into(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let body = notification.to_body()?;
        let mut manager = ConnectionManager::new(self.connector.clone(), self.queue.clone())
            .with_policy(self.policy.clone());

        let result: Result<()> = async {
            let session = manager.connect().await?;
            session
                .publish(&self.queue, OutgoingMessage::json(body))
                .await
        }
        .await;

        // The session is request-scoped and released whatever the outcome.
        if let Err(e) = manager.close().await {
            warn!(error = %e, "Error while closing producer session");
        }

        result
    }
}

#[async_trait]
impl<C> NotificationPublisher for Producer<C>
where
    C: Connector + Clone + 'static,
{
    async fn publish(&self, notification: &Notification) -> Result<()> {
        match self.send(notification).await {
            Ok(()) => {
                info!(notification_id = %notification.id, "Notification sent to queue");
                Ok(())
            }
            Err(e) => {
                error!(
                    notification_id = %notification.id,
                    error = %e,
                    "Failed to send notification to queue"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::broker::memory::MemoryBroker;
    use crate::domain::{NewNotification, Priority};
    use std::time::Duration;

    fn notification() -> Notification {
        Notification::new(NewNotification {
            subject: "S".to_string(),
            message: "M".to_string(),
            recipients: vec!["a@b.com".to_string()],
            priority: Priority::High,
        })
    }

    #[tokio::test]
    async fn test_publish_enqueues_one_persistent_json_message() {
        let broker = MemoryBroker::new();
        let producer = Producer::new(broker.clone(), "notifications");
        let notification = notification();

        producer.publish(&notification).await.unwrap();

        let messages = broker.ready_messages("notifications");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].persistent);
        assert_eq!(messages[0].content_type, "application/json");
        assert_eq!(Notification::from_body(&messages[0].body).unwrap(), notification);
    }

    #[tokio::test]
    async fn test_each_publish_uses_its_own_session() {
        let broker = MemoryBroker::new();
        let producer = Producer::new(broker.clone(), "notifications");

        producer.publish(&notification()).await.unwrap();
        producer.publish(&notification()).await.unwrap();

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.ready_count("notifications"), 2);
    }

    #[tokio::test]
    async fn test_publish_failure_propagates() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(5);
        let producer = Producer::new(broker.clone(), "notifications")
            .with_policy(RetryPolicy::with_unit(Duration::from_millis(1)));

        let err = producer.publish(&notification()).await.unwrap_err();

        assert!(matches!(err, Error::ConnectionExhausted { attempts: 5 }));
        assert_eq!(broker.ready_count("notifications"), 0);
    }
}
