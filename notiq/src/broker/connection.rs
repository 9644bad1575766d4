//! Connection manager with bounded retry and exponential backoff.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{Connector, QueueSession};
use crate::{Error, Result};

/// Maximum connection attempts before giving up.
pub const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Exponential backoff base.
pub const BACKOFF_BASE: u32 = 2;

/// Retry policy for establishing a broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: u32,
    /// Duration of one backoff time unit.
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_CONNECT_ATTEMPTS,
            base: BACKOFF_BASE,
            unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Same attempt count and base, with a different time unit.
    pub fn with_unit(unit: Duration) -> Self {
        Self {
            unit,
            ..Self::default()
        }
    }

    /// Wait after the failed `attempt` (1-based): `unit * base^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.base.saturating_pow(attempt);
        self.unit.saturating_mul(factor)
    }
}

/// Owns at most one live session to the broker.
///
/// Closing the session is the owner's responsibility (see [`ConnectionManager::close`]).
pub struct ConnectionManager<C: Connector> {
    connector: C,
    queue: String,
    policy: RetryPolicy,
    prefetch: Option<u16>,
    session: Option<C::Session>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, queue: impl Into<String>) -> Self {
        Self {
            connector,
            queue: queue.into(),
            policy: RetryPolicy::default(),
            prefetch: None,
            session: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Apply an unacknowledged-message limit on every new session.
    pub fn with_prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(QueueSession::is_open)
    }

    /// Return the live session, establishing one if none exists or the current
    /// one has failed.
    pub async fn connect(&mut self) -> Result<&mut C::Session> {
        if !self.is_connected() {
            self.session = None;
            let session =
                Self::establish(&self.connector, &self.queue, &self.policy, self.prefetch).await?;
            self.session = Some(session);
        }
        self.session.as_mut().ok_or(Error::NotConnected)
    }

    /// Drop the current session (if any) and establish a new one.
    pub async fn reconnect(&mut self) -> Result<&mut C::Session> {
        if let Some(mut stale) = self.session.take()
            && let Err(e) = stale.close().await
        {
            debug!(error = %e, "Ignoring error while closing stale session");
        }
        self.connect().await
    }

    /// The current session, without connecting.
    pub fn session(&mut self) -> Option<&mut C::Session> {
        self.session.as_mut()
    }

    /// Close the session if one is open.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take()
            && session.is_open()
        {
            session.close().await?;
            info!(broker = %self.connector.describe(), "Broker connection closed");
        }
        Ok(())
    }

    async fn establish(
        connector: &C,
        queue: &str,
        policy: &RetryPolicy,
        prefetch: Option<u16>,
    ) -> Result<C::Session> {
        let max = policy.max_attempts;
        let broker = connector.describe();

        for attempt in 1..=max {
            match connector.open().await {
                Ok(mut session) => {
                    session.declare_queue(queue).await?;
                    if let Some(count) = prefetch {
                        session.set_prefetch(count).await?;
                    }
                    info!(broker = %broker, queue = %queue, "Successfully connected to broker");
                    return Ok(session);
                }
                Err(e) => {
                    warn!(
                        broker = %broker,
                        error = %e,
                        "Failed to connect to broker (attempt {}/{})",
                        attempt,
                        max
                    );
                    if attempt < max {
                        let delay = policy.delay_for(attempt);
                        info!("Retrying in {:?}...", delay);
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(Error::ConnectionExhausted { attempts: max })
    }
}
