//! Line commands typed into the monitor's console.
//!
//! - `<channel> <value>`: queue a command for a write channel.
//! - `reset` (or `clear`): drop every sample held by the store.

use crate::data::store::SampledChannelStore;
use crate::error::{AppResult, DaqError};
use crate::poll::PollHandle;
use tracing::info;

/// One parsed console line.
#[derive(Clone, Debug, PartialEq)]
pub enum ConsoleCommand {
    /// Queue `value` for the write channel `channel`.
    Set {
        /// Write channel id.
        channel: String,
        /// Command value.
        value: f64,
    },
    /// Clear the sample store.
    Reset,
}

impl ConsoleCommand {
    /// Parse a line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> AppResult<Option<Self>> {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (None, _, _) => Ok(None),
            (Some(word), None, None)
                if word.eq_ignore_ascii_case("reset") || word.eq_ignore_ascii_case("clear") =>
            {
                Ok(Some(ConsoleCommand::Reset))
            }
            (Some(channel), Some(value), None) => {
                let value = value.parse::<f64>().map_err(|e| {
                    DaqError::Configuration(format!("'{value}' is not a number: {e}"))
                })?;
                Ok(Some(ConsoleCommand::Set {
                    channel: channel.to_string(),
                    value,
                }))
            }
            _ => Err(DaqError::Configuration(format!(
                "expected '<channel> <value>' or 'reset', got '{}'",
                line.trim()
            ))),
        }
    }

    /// Carry the command out against a running loop and its store.
    pub fn apply(&self, handle: &PollHandle, store: &SampledChannelStore) -> AppResult<()> {
        match self {
            ConsoleCommand::Set { channel, value } => {
                handle.command(channel, *value)?;
                info!(channel = %channel, value, "Command queued");
            }
            ConsoleCommand::Reset => store.reset(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Channel;
    use crate::data::store::StoreConfig;
    use crate::poll::{PollConfig, PollLoop, PollMode};
    use crate::PollCycleResult;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn parses_commands_and_reset() {
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
        assert_eq!(ConsoleCommand::parse("RESET").unwrap(), Some(ConsoleCommand::Reset));
        assert_eq!(ConsoleCommand::parse("clear").unwrap(), Some(ConsoleCommand::Reset));
        assert_eq!(
            ConsoleCommand::parse("CMD 42.5").unwrap(),
            Some(ConsoleCommand::Set {
                channel: "CMD".to_string(),
                value: 42.5
            })
        );
        assert!(ConsoleCommand::parse("CMD hot").is_err());
        assert!(ConsoleCommand::parse("CMD 1 2").is_err());
        assert!(ConsoleCommand::parse("reset now").is_err());
    }

    #[test]
    fn reset_line_clears_the_store() {
        let store =
            Arc::new(SampledChannelStore::new(["PV", "CMD"], StoreConfig::default()).unwrap());
        let config = PollConfig::new(
            vec![Channel::read("PV"), Channel::write("CMD")],
            Duration::from_secs(1),
            PollMode::Monitor,
        );
        let poll = PollLoop::new(config, Arc::clone(&store)).unwrap();
        let handle = poll.handle();

        for value in [1.0, 2.0] {
            let mut cycle = PollCycleResult::new(Instant::now());
            cycle.record("PV", Some(value));
            cycle.record("CMD", None);
            store.append(cycle).unwrap();
        }
        assert_eq!(store.len(), 2);

        ConsoleCommand::parse("reset")
            .unwrap()
            .unwrap()
            .apply(&handle, &store)
            .unwrap();
        assert!(store.is_empty());

        let unknown = ConsoleCommand::parse("PV 3").unwrap().unwrap();
        assert!(matches!(
            unknown.apply(&handle, &store),
            Err(DaqError::UnknownChannel(_))
        ));
        let queued = ConsoleCommand::parse("CMD 3").unwrap().unwrap();
        assert!(queued.apply(&handle, &store).is_ok());
    }
}
