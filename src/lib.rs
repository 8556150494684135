//! # Peltier DAQ Core Library
//!
//! Acquisition and excitation for a two-loop Peltier thermal plate. A fixed-period poll
//! loop reads and commands the plate's channels through a session, appends each cycle
//! to a bounded store shared with timer-driven consumers, and records experiments to
//! CSV one row per cycle.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (TOML file plus `PELTIER_DAQ_`
//!   environment overrides) and its validation.
//! - **`console`**: Line commands accepted by the monitor (`<channel> <value>`, `reset`).
//! - **`core`**: Channels, samples and the per-cycle result shared by every component.
//! - **`data`**: The [`SampledChannelStore`](data::store::SampledChannelStore), the CSV
//!   row sink and the recording reader used for offline inspection.
//! - **`error`**: The `DaqError` enum separating channel, session, configuration and
//!   persistence failures.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`poll`**: The poll loop, its lifecycle state machine and cancellation.
//! - **`render`**: Snapshot consumers driven by a refresh timer.
//! - **`session`**: `Session`/`Connector` traits, the reconnect policy, the simulated
//!   plate and a scripted mock.
//! - **`signal`**: Excitation command sequences (PRBS shaping, triangular Fourier series).

pub mod config;
pub mod console;
pub mod core;
pub mod data;
pub mod error;
pub mod logging;
pub mod poll;
pub mod render;
pub mod session;
pub mod signal;

pub use crate::core::{Channel, Direction, PollCycleResult, Sample};
pub use crate::data::store::{SampledChannelStore, StoreConfig, StoreSnapshot, TimeBase};
pub use crate::error::{AppResult, DaqError};
pub use crate::poll::{CancelToken, LoopState, PollConfig, PollHandle, PollLoop, PollMode};
