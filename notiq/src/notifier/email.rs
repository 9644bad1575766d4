//! Email notification channel using SMTP.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info, warn};

use super::Notifier;
use crate::Result;
use crate::config::{Lookup, parsed_var, string_var};
use crate::domain::Notification;

/// Email channel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailConfig {
    /// SMTP server host.
    pub smtp_host: String,
    /// SMTP server port.
    pub smtp_port: u16,
    /// SMTP username.
    pub smtp_username: Option<String>,
    /// SMTP password.
    pub smtp_password: Option<String>,
    /// Sender email address.
    pub from_address: String,
    /// Timeout for a single SMTP exchange.
    pub timeout: Duration,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            from_address: "notifications@example.com".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl EmailConfig {
    /// Supported keys: `SMTP_HOST`, `SMTP_PORT`, `SMTP_USER`, `SMTP_PASSWORD`,
    /// `EMAIL_SENDER`, `SMTP_TIMEOUT_SECS`.
    pub fn from_lookup(lookup: &impl Lookup) -> Self {
        let mut config = Self::default();

        if let Some(host) = string_var(lookup, "SMTP_HOST") {
            config.smtp_host = host;
        }
        if let Some(port) = parsed_var(lookup, "SMTP_PORT") {
            config.smtp_port = port;
        }
        config.smtp_username = string_var(lookup, "SMTP_USER");
        config.smtp_password = string_var(lookup, "SMTP_PASSWORD");
        if let Some(sender) = string_var(lookup, "EMAIL_SENDER") {
            config.from_address = sender;
        }
        if let Some(secs) = parsed_var(lookup, "SMTP_TIMEOUT_SECS") {
            config.timeout = Duration::from_secs(secs);
        }

        config
    }

    /// Credentials are required for delivery; without them sending is skipped.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.smtp_username, &self.smtp_password) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some(Credentials::new(user.clone(), password.clone()))
            }
            _ => None,
        }
    }
}

/// Email notification channel.
pub struct EmailNotifier {
    config: EmailConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl EmailNotifier {
    /// Create a new email channel. The SMTP transport is only built when
    /// credentials are configured.
    pub fn new(config: EmailConfig) -> Result<Self> {
        let transport = match config.credentials() {
            Some(credentials) => Some(
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
                    .port(config.smtp_port)
                    .credentials(credentials)
                    .timeout(Some(config.timeout))
                    .build(),
            ),
            None => None,
        };

        Ok(Self { config, transport })
    }

    pub fn is_configured(&self) -> bool {
        self.transport.is_some()
    }

    /// Compose the outgoing email: every recipient in `To`, plain-text body.
    pub fn build_message(&self, notification: &Notification) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.config.from_address.parse::<Mailbox>()?)
            .subject(notification.subject.clone());

        for recipient in &notification.recipients {
            builder = builder.to(recipient.parse::<Mailbox>()?);
        }

        let message = builder
            .header(ContentType::TEXT_PLAIN)
            .body(notification.message.clone())?;
        Ok(message)
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn channel_type(&self) -> &'static str {
        "email"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let Some(transport) = &self.transport else {
            warn!(
                notification_id = %notification.id,
                "SMTP not configured, skipping email notification"
            );
            return Ok(());
        };

        let message = self.build_message(notification)?;
        debug!(
            notification_id = %notification.id,
            host = %self.config.smtp_host,
            port = self.config.smtp_port,
            "Sending email notification"
        );

        transport.send(message).await?;

        info!(
            notification_id = %notification.id,
            "Email notification sent to {} recipients",
            notification.recipients.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::lookup;
    use crate::domain::{NewNotification, Priority};

    fn notification(recipients: &[&str]) -> Notification {
        Notification::new(NewNotification {
            subject: "Disk almost full".to_string(),
            message: "Volume /data is at 95%".to_string(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            priority: Priority::High,
        })
    }

    fn configured() -> EmailConfig {
        EmailConfig {
            smtp_host: "smtp.example.com".to_string(),
            smtp_username: Some("user".to_string()),
            smtp_password: Some("secret".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_email_config_default() {
        let config = EmailConfig::default();
        assert_eq!(config.smtp_host, "smtp.gmail.com");
        assert_eq!(config.smtp_port, 587);
        assert_eq!(config.from_address, "notifications@example.com");
        assert!(config.credentials().is_none());
    }

    #[test]
    fn test_email_config_from_lookup() {
        let config = EmailConfig::from_lookup(&lookup(&[
            ("SMTP_HOST", "mail.internal"),
            ("SMTP_PORT", "2525"),
            ("SMTP_USER", "bot"),
            ("SMTP_PASSWORD", "hunter2"),
            ("EMAIL_SENDER", "alerts@internal"),
        ]));
        assert_eq!(config.smtp_host, "mail.internal");
        assert_eq!(config.smtp_port, 2525);
        assert_eq!(config.from_address, "alerts@internal");
        assert!(config.credentials().is_some());
    }

    #[test]
    fn test_password_alone_is_not_configured() {
        let config = EmailConfig {
            smtp_password: Some("secret".to_string()),
            ..Default::default()
        };
        let notifier = EmailNotifier::new(config).unwrap();
        assert!(!notifier.is_configured());
    }

    #[tokio::test]
    async fn test_unconfigured_send_is_a_noop() {
        let notifier = EmailNotifier::new(EmailConfig::default()).unwrap();
        assert!(!notifier.is_configured());

        notifier.send(&notification(&["a@b.com"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_notifier_builds_transport() {
        let notifier = EmailNotifier::new(configured()).unwrap();
        assert!(notifier.is_configured());
        assert_eq!(notifier.channel_type(), "email");
    }

    #[tokio::test]
    async fn test_build_message_addresses_all_recipients() {
        let notifier = EmailNotifier::new(configured()).unwrap();
        let message = notifier
            .build_message(&notification(&["a@b.com", "c@d.org"]))
            .unwrap();

        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("a@b.com"));
        assert!(raw.contains("c@d.org"));
        assert!(raw.contains("Subject: Disk almost full"));
        assert!(raw.contains("Volume /data is at 95%"));
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_a_delivery_failure() {
        let notifier = EmailNotifier::new(configured()).unwrap();
        let err = notifier
            .send(&notification(&["not-an-address"]))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Email(_)));
    }
}
