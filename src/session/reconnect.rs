//! Reconnect policy owned by the session side.
//!
//! The poll loop never reconnects by itself. When a connector is wrapped in a
//! [`ReconnectingConnector`], the initial handshake is retried with backoff, and a
//! session-level failure during the run triggers one reconnect attempt after which the
//! failed operation is retried once. Further attempts are spaced by the same backoff
//! and never block an operation.

use super::{Connector, Session};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// How often and how patiently to reconnect.
///
/// A `backoff_multiplier` of `1.0` gives a fixed delay between attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Attempts after the first failure. `0` disables reconnecting.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: default_max_delay(),
        }
    }
}

impl ReconnectPolicy {
    /// Same delay before every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Delay to wait before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Connect, retrying session-level failures according to `policy`.
pub async fn connect_with_policy(
    connector: &dyn Connector,
    endpoint: &str,
    policy: &ReconnectPolicy,
) -> AppResult<Box<dyn Session>> {
    let mut attempt = 0;
    loop {
        match connector.connect(endpoint).await {
            Ok(session) => {
                if attempt > 0 {
                    info!(endpoint, attempts = attempt + 1, "Reconnected");
                }
                return Ok(session);
            }
            Err(e) if e.is_session_level() && attempt < policy.max_attempts => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!(endpoint, error = %e, retry = attempt, ?delay, "Connect failed, retrying");
                sleep(delay).await;
            }
            Err(e) if e.is_session_level() => {
                return Err(DaqError::Session(format!(
                    "giving up on {endpoint} after {} attempts: {e}",
                    attempt + 1
                )));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Connector wrapper that hands out self-healing sessions.
pub struct ReconnectingConnector<C> {
    inner: Arc<C>,
    policy: ReconnectPolicy,
}

impl<C: Connector + 'static> ReconnectingConnector<C> {
    pub fn new(inner: C, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(inner),
            policy,
        }
    }
}

#[async_trait]
impl<C: Connector + 'static> Connector for ReconnectingConnector<C> {
    async fn connect(&self, endpoint: &str) -> AppResult<Box<dyn Session>> {
        let session = connect_with_policy(self.inner.as_ref(), endpoint, &self.policy).await?;
        Ok(Box::new(ReconnectingSession {
            connector: Arc::clone(&self.inner),
            endpoint: endpoint.to_string(),
            policy: self.policy.clone(),
            session: Some(session),
            failed_attempts: 0,
            next_attempt: None,
        }))
    }
}

/// Session that transparently reconnects after a session-level failure.
///
/// Inside a running session each operation makes at most one connection attempt, so
/// a dead endpoint surfaces as `DaqError::Session` right away instead of stalling the
/// caller's per-operation timeout. After a failed attempt, operations fail fast until
/// the policy's backoff delay has elapsed. How long to keep trying is the caller's
/// retry budget.
pub struct ReconnectingSession<C> {
    connector: Arc<C>,
    endpoint: String,
    policy: ReconnectPolicy,
    session: Option<Box<dyn Session>>,
    failed_attempts: u32,
    next_attempt: Option<Instant>,
}

impl<C: Connector + 'static> ReconnectingSession<C> {
    async fn session(&mut self) -> AppResult<&mut Box<dyn Session>> {
        if self.session.is_none() {
            self.reconnect().await?;
        }
        self.session
            .as_mut()
            .ok_or_else(|| DaqError::Session(format!("{} is not connected", self.endpoint)))
    }

    async fn reconnect(&mut self) -> AppResult<()> {
        if let Some(at) = self.next_attempt {
            if Instant::now() < at {
                return Err(DaqError::Session(format!(
                    "{} is down, next reconnect attempt in {:?}",
                    self.endpoint,
                    at.saturating_duration_since(Instant::now())
                )));
            }
        }

        match self.connector.connect(&self.endpoint).await {
            Ok(session) => {
                info!(
                    endpoint = %self.endpoint,
                    attempts = self.failed_attempts + 1,
                    "Reconnected"
                );
                self.session = Some(session);
                self.failed_attempts = 0;
                self.next_attempt = None;
                Ok(())
            }
            Err(e) => {
                self.failed_attempts = self.failed_attempts.saturating_add(1);
                let delay = self.policy.delay_for(self.failed_attempts);
                self.next_attempt = Some(Instant::now() + delay);
                warn!(
                    endpoint = %self.endpoint,
                    error = %e,
                    attempt = self.failed_attempts,
                    ?delay,
                    "Reconnect failed"
                );
                Err(match e {
                    DaqError::Session(_) => e,
                    other => DaqError::Session(format!(
                        "reconnect to {} failed: {other}",
                        self.endpoint
                    )),
                })
            }
        }
    }

    fn drop_session(&mut self, error: &DaqError) {
        warn!(endpoint = %self.endpoint, %error, "Session lost, reconnecting");
        self.session = None;
    }
}

#[async_trait]
impl<C: Connector + 'static> Session for ReconnectingSession<C> {
    async fn read(&mut self, node: &str) -> AppResult<f64> {
        let result = self.session().await?.read(node).await;
        match result {
            Err(e) if e.is_session_level() => {
                self.drop_session(&e);
                self.session().await?.read(node).await
            }
            other => other,
        }
    }

    async fn write(&mut self, node: &str, value: f64) -> AppResult<()> {
        let result = self.session().await?.write(node, value).await;
        match result {
            Err(e) if e.is_session_level() => {
                self.drop_session(&e);
                self.session().await?.write(node, value).await
            }
            other => other,
        }
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        match self.session.take() {
            Some(mut session) => session.disconnect().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::{MockConnector, MockResponse};

    #[test]
    fn exponential_delays_are_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = ReconnectPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), policy.delay_for(3));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_endpoint_fails_fast_with_session_errors() {
        let mock = MockConnector::new()
            .script("A", [MockResponse::Value(1.0), MockResponse::SessionLost]);
        let connector = ReconnectingConnector::new(mock.clone(), ReconnectPolicy::default());
        let mut session = connector.connect("mock://plate").await.unwrap();
        assert_eq!(session.read("A").await.unwrap(), 1.0);

        let mock = mock.fail_connects(usize::MAX);
        let started = Instant::now();
        let err = session.read("A").await.unwrap_err();
        assert!(err.is_session_level());
        // Backing off: no connection attempt, still a session error.
        assert!(session.read("A").await.unwrap_err().is_session_level());
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_once_backoff_has_elapsed() {
        let mock = MockConnector::new()
            .script("A", [MockResponse::SessionLost])
            .value("A", 7.0);
        let connector = ReconnectingConnector::new(
            mock.clone(),
            ReconnectPolicy::fixed(3, Duration::from_secs(1)),
        );
        let mut session = connector.connect("mock://plate").await.unwrap();

        let mock = mock.fail_connects(1);
        assert!(session.read("A").await.is_err());
        assert!(session.read("A").await.is_err());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(session.read("A").await.unwrap(), 7.0);
        assert_eq!(mock.connects(), 2);
    }

    #[test]
    fn policy_parses_humantime_durations() {
        let policy: ReconnectPolicy = toml::from_str(
            r#"
            max_attempts = 4
            initial_delay = "1s"
            "#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }
}
