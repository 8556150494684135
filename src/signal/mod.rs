//! Excitation signals for identification experiments.
//!
//! An experiment applies a pre-computed [`CommandSequence`] to the plate, one value per
//! sampling period. Sequences come from a text file of raw levels (typically a PRBS
//! of 0/1 values) mapped onto the plate's operating range by [`ExcitationShaping`], or
//! are synthesised from a truncated Fourier series with [`triangular`].
//!
//! [`mpc`] builds the prediction matrices used to design a controller from a model
//! identified with these experiments.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub mod mpc;
pub mod triangular;

/// Maps raw levels onto MV commands around an operating point.
///
/// `command = operating_point + gain * (raw - offset)`. The shaped sequence starts with
/// `pre_roll` samples at the operating point so the plate settles before excitation,
/// and ends with `final_command` so it is left de-energised.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExcitationShaping {
    #[serde(default = "default_offset")]
    pub offset: f64,
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default = "default_operating_point")]
    pub operating_point: f64,
    #[serde(default = "default_pre_roll")]
    pub pre_roll: usize,
    #[serde(default = "default_final_command")]
    pub final_command: Option<f64>,
}

fn default_offset() -> f64 {
    0.5
}

fn default_gain() -> f64 {
    20.0
}

fn default_operating_point() -> f64 {
    20.0
}

fn default_pre_roll() -> usize {
    10
}

fn default_final_command() -> Option<f64> {
    Some(0.0)
}

impl Default for ExcitationShaping {
    fn default() -> Self {
        Self {
            offset: default_offset(),
            gain: default_gain(),
            operating_point: default_operating_point(),
            pre_roll: default_pre_roll(),
            final_command: default_final_command(),
        }
    }
}

impl ExcitationShaping {
    /// Pass values through unchanged: no pre-roll, no final command.
    pub fn identity() -> Self {
        Self {
            offset: 0.0,
            gain: 1.0,
            operating_point: 0.0,
            pre_roll: 0,
            final_command: None,
        }
    }
}

/// Ordered commands to apply, one per cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandSequence {
    values: Vec<f64>,
}

impl CommandSequence {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Parse a text file of numbers separated by commas, whitespace or newlines.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DaqError::Configuration(format!("Cannot read command sequence {}: {e}", path.display()))
        })?;
        Self::parse(&text)
            .map_err(|e| DaqError::Configuration(format!("{}: {e}", path.display())))
    }

    /// Parse numbers separated by commas, whitespace or newlines.
    pub fn parse(text: &str) -> Result<Self, String> {
        let values = text
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .enumerate()
            .map(|(i, token)| {
                token
                    .parse::<f64>()
                    .map_err(|e| format!("value #{} '{token}': {e}", i + 1))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if values.is_empty() {
            return Err("command sequence is empty".to_string());
        }
        Ok(Self { values })
    }

    /// Map raw levels to commands.
    pub fn shape(&self, shaping: &ExcitationShaping) -> Self {
        let pre = std::iter::repeat(shaping.operating_point).take(shaping.pre_roll);
        let body = self
            .values
            .iter()
            .map(|raw| shaping.operating_point + shaping.gain * (raw - shaping.offset));
        let values = pre.chain(body).chain(shaping.final_command).collect();
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    /// Wall time needed to apply the whole sequence at `period`.
    pub fn estimated_duration(&self, period: Duration) -> Duration {
        period.saturating_mul(u32::try_from(self.values.len()).unwrap_or(u32::MAX))
    }
}

impl From<Vec<f64>> for CommandSequence {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_mixed_separators() {
        let seq = CommandSequence::parse("0,1, 1\n0\t1\n").unwrap();
        assert_eq!(seq.values(), &[0.0, 1.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn rejects_garbage_and_empty_files() {
        assert!(CommandSequence::parse("0,1,x").unwrap_err().contains("#3"));
        assert!(CommandSequence::parse(" \n ").is_err());
    }

    #[test]
    fn shaping_adds_pre_roll_and_final_command() {
        let raw = CommandSequence::new(vec![0.0, 1.0]);
        let shaped = raw.shape(&ExcitationShaping {
            pre_roll: 2,
            ..ExcitationShaping::default()
        });
        assert_eq!(shaped.values(), &[20.0, 20.0, 10.0, 30.0, 0.0]);
    }

    #[test]
    fn identity_shaping_is_a_no_op() {
        let raw = CommandSequence::new(vec![10.0, 20.0, 30.0]);
        assert_eq!(raw.shape(&ExcitationShaping::identity()), raw);
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "1,0,1").unwrap();
        let seq = CommandSequence::load(file.path()).unwrap();
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.estimated_duration(Duration::from_secs(2)), Duration::from_secs(6));
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err = CommandSequence::load("/nonexistent/prbs.txt").unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }
}
