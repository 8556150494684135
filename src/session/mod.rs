//! Sessions against the plate's automation endpoint.
//!
//! The protocol client itself lives outside this crate. Everything here talks to it
//! through two small traits:
//!
//! - [`Connector`] opens a [`Session`] for an endpoint address.
//! - [`Session`] reads and writes named nodes and can be disconnected.
//!
//! Errors follow the [`DaqError`](crate::error::DaqError) taxonomy: a failure that
//! only concerns one node is `DaqError::Channel`, a lost connection is
//! `DaqError::Session`. The poll loop relies on that distinction.
//!
//! Implementations shipped with the crate:
//!
//! - [`simulated::SimulatedConnector`] - first-order thermal model of the two-loop plate
//! - [`mock::MockConnector`] - scripted sessions for tests
//! - [`reconnect::ReconnectingConnector`] - wraps any connector with a reconnect policy

use crate::error::AppResult;
use async_trait::async_trait;

pub mod mock;
pub mod reconnect;
pub mod simulated;

pub use reconnect::{ReconnectPolicy, ReconnectingConnector};

/// An open connection through which node reads and writes are issued.
///
/// A session is owned by exactly one poll loop, hence `&mut self`.
#[async_trait]
pub trait Session: Send {
    /// Read the current value of a node.
    async fn read(&mut self, node: &str) -> AppResult<f64>;

    /// Write a value to a node. `Ok(())` is the server's acknowledgement.
    async fn write(&mut self, node: &str, value: f64) -> AppResult<()>;

    /// Close the connection. Further calls may fail with `DaqError::Session`.
    async fn disconnect(&mut self) -> AppResult<()>;
}

/// Opens sessions against endpoint addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the handshake with `endpoint`.
    async fn connect(&self, endpoint: &str) -> AppResult<Box<dyn Session>>;
}
