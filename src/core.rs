//! Core data types shared by the store, the poll loop and the sinks.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::Instant;

/// Whether a channel is observed or actuated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Polled with a read every cycle.
    Read,
    /// Commanded with writes; the loop records the value that was sent.
    Write,
}

/// One monitored or actuated point of the plate.
///
/// `id` is the label used as the store key and CSV column; `node` is the address the
/// session understands. Several channels may share a node, e.g. a `CMD` write channel
/// and an `MV2` read-back channel pointing at the same variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    node: Option<String>,
    pub direction: Direction,
}

impl Channel {
    /// A read channel whose node id equals its label.
    pub fn read(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node: None,
            direction: Direction::Read,
        }
    }

    /// A write channel whose node id equals its label.
    pub fn write(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node: None,
            direction: Direction::Write,
        }
    }

    /// Point the channel at a session node different from its label.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Node id used on the session.
    pub fn node(&self) -> &str {
        self.node.as_deref().unwrap_or(&self.id)
    }

    pub fn is_read(&self) -> bool {
        self.direction == Direction::Read
    }

    pub fn is_write(&self) -> bool {
        self.direction == Direction::Write
    }
}

/// A single observation of one channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the store origin, or Unix seconds for wall-clock stores.
    pub timestamp: f64,
    pub channel_id: String,
    /// `None` marks a failed read or write.
    pub value: Option<f64>,
}

/// Everything one poll cycle observed or commanded, stamped with a single instant.
#[derive(Clone, Debug)]
pub struct PollCycleResult {
    pub at: Instant,
    values: HashMap<String, Option<f64>>,
}

impl PollCycleResult {
    pub fn new(at: Instant) -> Self {
        Self {
            at,
            values: HashMap::new(),
        }
    }

    /// Record the outcome for a channel. Later calls overwrite earlier ones.
    pub fn record(&mut self, channel_id: impl Into<String>, value: Option<f64>) {
        self.values.insert(channel_id.into(), value);
    }

    /// Builder form of [`record`](Self::record).
    pub fn with(mut self, channel_id: impl Into<String>, value: Option<f64>) -> Self {
        self.record(channel_id, value);
        self
    }

    /// Value for a channel; channels never recorded read as absent.
    pub fn value(&self, channel_id: &str) -> Option<f64> {
        self.values.get(channel_id).copied().flatten()
    }

    pub(crate) fn channel_ids(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_defaults_to_id() {
        let pv = Channel::read("PV1");
        assert_eq!(pv.node(), "PV1");

        let cmd = Channel::write("CMD").with_node("ns=2;s=MV2");
        assert_eq!(cmd.node(), "ns=2;s=MV2");
        assert!(cmd.is_write());
    }

    #[test]
    fn channel_parses_from_toml() {
        let channel: Channel = toml::from_str(
            r#"
            id = "PV2"
            node = "ns=2;s=0:PlacaTermica.Malha2?PlacaTermica.Malha2.PV"
            direction = "read"
            "#,
        )
        .unwrap();
        assert_eq!(channel.id, "PV2");
        assert!(channel.is_read());
        assert!(channel.node().ends_with("Malha2.PV"));
    }

    #[test]
    fn unrecorded_channels_are_absent() {
        let cycle = PollCycleResult::new(Instant::now()).with("A", Some(1.0)).with("B", None);
        assert_eq!(cycle.value("A"), Some(1.0));
        assert_eq!(cycle.value("B"), None);
        assert_eq!(cycle.value("C"), None);
    }
}
