//! Poll loop lifecycle.

use serde::{Deserialize, Serialize};

/// Lifecycle of a [`PollLoop`](super::PollLoop).
///
/// # State Machine
///
/// ```text
/// Idle ──run──> Connecting ──handshake ok──> Running ──cancel / sequence done──> Stopping ──> Stopped
///                   │                           │
///                   └──handshake failed──┐      └──retries exhausted / persistence failed──┐
///                                        ▼                                                 ▼
///                                     Faulted <────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    /// Not started yet
    Idle,
    /// Opening the session
    Connecting,
    /// Polling cycles
    Running,
    /// Flushing persistence and closing the session
    Stopping,
    /// Finished cleanly
    Stopped,
    /// Finished with an error reported to the caller
    Faulted,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Idle => write!(f, "Idle"),
            LoopState::Connecting => write!(f, "Connecting"),
            LoopState::Running => write!(f, "Running"),
            LoopState::Stopping => write!(f, "Stopping"),
            LoopState::Stopped => write!(f, "Stopped"),
            LoopState::Faulted => write!(f, "Faulted"),
        }
    }
}

impl LoopState {
    /// True once the loop will never poll again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Stopped | LoopState::Faulted)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: LoopState) -> bool {
        use LoopState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Running)
                | (Connecting, Faulted)
                | (Running, Stopping)
                | (Running, Faulted)
                | (Stopping, Stopped)
                | (Stopping, Faulted)
        )
    }
}
