//! Notification delivery channels.
//!
//! - Email (SMTP) for high-priority notifications

pub mod email;

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::domain::Notification;

pub use email::{EmailConfig, EmailNotifier};

/// A delivery channel for notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Get the channel type name.
    fn channel_type(&self) -> &'static str;

    /// Deliver a notification. Errors are transport failures and make the
    /// message eligible for redelivery.
    async fn send(&self, notification: &Notification) -> Result<()>;
}

#[async_trait]
impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    fn channel_type(&self) -> &'static str {
        (**self).channel_type()
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        (**self).send(notification).await
    }
}
