//! Request and response bodies.

use chrono::{DateTime, Utc};
use lettre::Address;
use serde::{Deserialize, Serialize};

use crate::domain::{NewNotification, Priority};
use crate::{Error, Result};

/// Body of `POST /notifications/`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateNotificationRequest {
    pub subject: String,
    pub message: String,
    pub recipients: Vec<String>,
    /// Any string is accepted; unknown values are handled like `low`.
    #[serde(default)]
    pub priority: Priority,
}

impl CreateNotificationRequest {
    /// Check the recipient list: non-empty, every entry a valid email address.
    pub fn validate(&self) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(Error::validation("recipients must not be empty"));
        }

        let invalid: Vec<&str> = self
            .recipients
            .iter()
            .filter(|r| r.parse::<Address>().is_err())
            .map(String::as_str)
            .collect();
        if !invalid.is_empty() {
            return Err(Error::validation(format!(
                "invalid email address(es): {}",
                invalid.join(", ")
            )));
        }

        Ok(())
    }

    pub fn into_new_notification(self) -> NewNotification {
        NewNotification {
            subject: self.subject,
            message: self.message,
            recipients: self.recipients,
            priority: self.priority,
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
}
