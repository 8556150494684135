//! Scripted sessions for tests and dry runs.
//!
//! A [`MockConnector`] owns shared state that every session it opens reads from, so a
//! test can keep a clone of the connector and inspect what the poll loop did after the
//! session has been moved into the loop.
//!
//! Reads are answered, in order of precedence, by:
//! 1. the next scripted [`MockResponse`] queued for the node,
//! 2. the last value written to the node (write echo),
//! 3. a fixed value set with [`MockConnector::value`].
//!
//! Anything else is a `DaqError::Channel`.
//!
//! # Example
//!
//! ```rust,ignore
//! let connector = MockConnector::new()
//!     .script("A", [MockResponse::Value(20.0), MockResponse::ChannelError])
//!     .value("B", 21.0);
//! let mut session = connector.connect("mock://plate").await?;
//! assert_eq!(session.read("A").await?, 20.0);
//! assert!(session.read("A").await.is_err());
//! ```

use super::{Connector, Session};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

/// One scripted answer to a read.
#[derive(Clone, Debug, PartialEq)]
pub enum MockResponse {
    Value(f64),
    /// The node reports a bad status; only this read fails.
    ChannelError,
    /// The connection drops; the session stays lost until reconnected.
    SessionLost,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<MockResponse>>,
    fixed: HashMap<String, f64>,
    written: HashMap<String, f64>,
    write_log: Vec<(String, f64)>,
    failing_writes: HashMap<String, usize>,
    read_delay: Option<Duration>,
    connect_failures: usize,
    connects: usize,
    disconnects: usize,
    reads: usize,
    generation: usize,
    lost: bool,
}

/// Connector handing out [`MockSession`]s over shared, scripted state.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue responses for successive reads of `node`.
    pub fn script(self, node: &str, responses: impl IntoIterator<Item = MockResponse>) -> Self {
        self.state()
            .scripts
            .entry(node.to_string())
            .or_default()
            .extend(responses);
        self
    }

    /// Answer reads of `node` with `value` once its script is exhausted.
    pub fn value(self, node: &str, value: f64) -> Self {
        self.state().fixed.insert(node.to_string(), value);
        self
    }

    /// Fail the next `count` writes to `node` with a channel error.
    pub fn fail_writes(self, node: &str, count: usize) -> Self {
        self.state().failing_writes.insert(node.to_string(), count);
        self
    }

    /// Refuse the next `count` connection attempts with a session error.
    pub fn fail_connects(self, count: usize) -> Self {
        self.state().connect_failures = count;
        self
    }

    /// Delay every read, to make cycles take real time.
    pub fn read_delay(self, delay: Duration) -> Self {
        self.state().read_delay = Some(delay);
        self
    }

    /// Every `(node, value)` write acknowledged so far.
    pub fn writes(&self) -> Vec<(String, f64)> {
        self.state().write_log.clone()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// Reads attempted, successful or not.
    pub fn reads(&self) -> usize {
        self.state().reads
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &str) -> AppResult<Box<dyn Session>> {
        let mut state = self.state();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(DaqError::Session(format!("{endpoint} refused the connection")));
        }
        state.connects += 1;
        state.generation += 1;
        state.lost = false;
        tracing::debug!(endpoint, generation = state.generation, "Mock session opened");
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
            generation: state.generation,
        }))
    }
}

/// Session backed by a [`MockConnector`]'s state.
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
    generation: usize,
}

impl MockSession {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_alive(&self, state: &MockState) -> AppResult<()> {
        if state.lost || state.generation != self.generation {
            Err(DaqError::Session("mock connection lost".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn read(&mut self, node: &str) -> AppResult<f64> {
        let delay = self.state().read_delay;
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        let mut state = self.state();
        state.reads += 1;
        self.check_alive(&state)?;

        match state.scripts.get_mut(node).and_then(VecDeque::pop_front) {
            Some(MockResponse::Value(v)) => Ok(v),
            Some(MockResponse::ChannelError) => Err(DaqError::channel(node, "bad status")),
            Some(MockResponse::SessionLost) => {
                state.lost = true;
                Err(DaqError::Session("mock connection lost".to_string()))
            }
            None => state
                .written
                .get(node)
                .or_else(|| state.fixed.get(node))
                .copied()
                .ok_or_else(|| DaqError::channel(node, "no value scripted")),
        }
    }

    async fn write(&mut self, node: &str, value: f64) -> AppResult<()> {
        let mut state = self.state();
        self.check_alive(&state)?;

        if let Some(remaining) = state.failing_writes.get_mut(node) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DaqError::channel(node, "write rejected"));
            }
        }
        state.written.insert(node.to_string(), value);
        state.write_log.push((node.to_string(), value));
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        let mut state = self.state();
        state.disconnects += 1;
        if state.generation == self.generation {
            state.lost = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_then_echo_then_fixed() {
        let connector = MockConnector::new()
            .script("MV", [MockResponse::Value(1.0)])
            .value("MV", 9.0);
        let mut session = connector.connect("mock://").await.unwrap();

        assert_eq!(session.read("MV").await.unwrap(), 1.0);
        assert_eq!(session.read("MV").await.unwrap(), 9.0);
        session.write("MV", 42.0).await.unwrap();
        assert_eq!(session.read("MV").await.unwrap(), 42.0);
        assert_eq!(connector.writes(), vec![("MV".to_string(), 42.0)]);
    }

    #[tokio::test]
    async fn session_loss_sticks_until_reconnect() {
        let connector = MockConnector::new()
            .script("A", [MockResponse::SessionLost])
            .value("A", 5.0);
        let mut session = connector.connect("mock://").await.unwrap();

        assert!(session.read("A").await.unwrap_err().is_session_level());
        assert!(session.read("A").await.unwrap_err().is_session_level());

        let mut fresh = connector.connect("mock://").await.unwrap();
        assert_eq!(fresh.read("A").await.unwrap(), 5.0);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn failed_writes_are_channel_errors() {
        let connector = MockConnector::new().fail_writes("MV", 1);
        let mut session = connector.connect("mock://").await.unwrap();

        let err = session.write("MV", 1.0).await.unwrap_err();
        assert!(!err.is_session_level());
        session.write("MV", 2.0).await.unwrap();
        assert_eq!(connector.writes(), vec![("MV".to_string(), 2.0)]);
    }

    #[tokio::test]
    async fn refused_connections_count_down() {
        let connector = MockConnector::new().fail_connects(1);
        assert!(connector.connect("mock://").await.is_err());
        assert!(connector.connect("mock://").await.is_ok());
    }
}
