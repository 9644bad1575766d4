//! Per-message processing: decode, route by priority, decide the settlement.

use std::fmt;

use tracing::{debug, error, info, warn};

use crate::domain::{Notification, Priority};
use crate::notifier::Notifier;

/// How a received message must be settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Processed; remove the message permanently.
    Acknowledge,
    /// Transient failure; hand the message back for redelivery.
    RejectAndRequeue,
    /// The message can never be processed; discard it.
    RejectAndDrop,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acknowledge => "ack",
            Self::RejectAndRequeue => "requeue",
            Self::RejectAndDrop => "drop",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routes decoded notifications to a notifier according to their priority.
pub struct Dispatcher<N> {
    notifier: N,
}

impl<N: Notifier> Dispatcher<N> {
    pub fn new(notifier: N) -> Self {
        Self { notifier }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Process one message body and return its disposition. Never panics and
    /// never returns an error: every outcome maps to a settlement.
    pub async fn process(&self, body: &[u8]) -> Disposition {
        let notification = match Notification::from_body(body) {
            Ok(notification) => notification,
            Err(e) => {
                error!(
                    error = %e,
                    body = %String::from_utf8_lossy(body),
                    "Failed to parse notification"
                );
                return Disposition::RejectAndDrop;
            }
        };

        let id = notification.id.clone();
        info!(notification_id = %id, "Processing notification");
        info!(
            notification_id = %id,
            subject = %notification.subject,
            priority = %notification.priority,
            "Notification received"
        );
        debug!(notification = ?notification, "Full notification data");

        match &notification.priority {
            Priority::High => {
                if let Err(e) = self.notifier.send(&notification).await {
                    error!(
                        notification_id = %id,
                        channel = self.notifier.channel_type(),
                        error = %e,
                        "Error processing notification"
                    );
                    return Disposition::RejectAndRequeue;
                }
            }
            // Log-only: there is no delivery channel for normal priority yet.
            Priority::Normal => {
                info!(notification_id = %id, "Normal priority notification");
            }
            Priority::Low => {
                info!(notification_id = %id, "Low priority notification logged");
            }
            Priority::Other(value) => {
                warn!(
                    notification_id = %id,
                    priority = %value,
                    "Unrecognized priority, handling as low"
                );
                info!(notification_id = %id, "Low priority notification logged");
            }
        }

        info!(notification_id = %id, "Notification processed successfully");
        Disposition::Acknowledge
    }
}
