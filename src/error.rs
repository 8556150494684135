//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! It separates failures by how far they are allowed to propagate:
//!
//! - **`Channel`**: a single read or write against one channel failed. The poll loop
//!   absorbs these and records an absent sample for the cycle.
//! - **`Session`**: the connection to the plate endpoint was lost or the handshake
//!   failed. The loop retries on the next scheduled cycle and reports a terminal
//!   failure once its retry budget is spent.
//! - **`Configuration`** / **`Config`**: semantic and parse errors in the configuration.
//!   Always fatal at startup, before any session is opened.
//! - **`Persistence`**: the CSV sink could not write or flush a row. Fatal for
//!   experiments, logged and tolerated by the monitor.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! so `?` works across I/O, CSV and figment boundaries.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel '{channel}' failed: {reason}")]
    Channel { channel: String, reason: String },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Shorthand for a transient failure on one channel.
    pub fn channel(channel: impl Into<String>, reason: impl ToString) -> Self {
        DaqError::Channel {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the error means the session itself is unusable, as opposed to a
    /// single channel operation failing.
    pub fn is_session_level(&self) -> bool {
        matches!(self, DaqError::Session(_) | DaqError::Io(_))
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for DaqError {
    fn from(value: csv::Error) -> Self {
        DaqError::Persistence(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_session_level_errors() {
        assert!(DaqError::Session("link down".into()).is_session_level());
        assert!(DaqError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .is_session_level());
        assert!(!DaqError::channel("PV1", "bad status").is_session_level());
        assert!(!DaqError::Persistence("disk full".into()).is_session_level());
    }

    #[test]
    fn channel_error_message_names_the_channel() {
        let err = DaqError::channel("MV2", "timed out");
        assert_eq!(err.to_string(), "Channel 'MV2' failed: timed out");
    }
}
