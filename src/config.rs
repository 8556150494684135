//! Configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/peltier.toml` unless overridden),
//! 2. environment variables prefixed with `PELTIER_DAQ_`, nested with `__`
//!    (e.g. `PELTIER_DAQ_SESSION__ENDPOINT=sim://bench`).
//!
//! Durations are humantime strings (`"200ms"`, `"2s"`). Everything is validated by
//! [`Config::validate`] before a session is opened.
//!
//! # Example
//! ```no_run
//! use peltier_daq::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_from("config/peltier.toml")?;
//! config.validate()?;
//! println!("Endpoint: {}", config.session.endpoint);
//! # Ok(())
//! # }
//! ```

use crate::core::Channel;
use crate::data::store::{StoreConfig, TimeBase};
use crate::error::{AppResult, DaqError};
use crate::logging::{parse_log_level, OutputFormat};
use crate::poll::{PollConfig, PollMode};
use crate::session::ReconnectPolicy;
use crate::signal::{triangular, CommandSequence, ExcitationShaping};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/peltier.toml";

/// Prefix of overriding environment variables.
pub const ENV_PREFIX: &str = "PELTIER_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Channels polled every cycle, in column order
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Identification experiment; required only by the `experiment` command
    #[serde(default)]
    pub experiment: Option<ExperimentConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Plate endpoint and failure handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Per-operation timeout; a slow node counts as a failed sample
    #[serde(default = "default_channel_timeout", with = "humantime_serde")]
    pub channel_timeout: Option<Duration>,
    /// Consecutive lost cycles tolerated before the run faults
    #[serde(default = "default_max_session_retries")]
    pub max_session_retries: u32,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            channel_timeout: default_channel_timeout(),
            max_session_retries: default_max_session_retries(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Live monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_period", with = "humantime_serde")]
    pub period: Duration,
    /// How often the render consumer takes a snapshot
    #[serde(default = "default_refresh", with = "humantime_serde")]
    pub refresh: Duration,
    /// Cycles kept in memory
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default)]
    pub time_base: TimeBase,
    /// Also record every cycle to this CSV file
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period: default_monitor_period(),
            refresh: default_refresh(),
            window_size: default_window_size(),
            time_base: TimeBase::default(),
            output_path: None,
        }
    }
}

/// Identification experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_experiment_period", with = "humantime_serde")]
    pub period: Duration,
    /// Raw excitation levels, one per cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_sequence_path: Option<PathBuf>,
    /// Synthesise the raw levels instead of loading them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triangular: Option<TriangularConfig>,
    #[serde(default = "default_experiment_output")]
    pub output_path: PathBuf,
    #[serde(flatten)]
    pub shaping: ExcitationShaping,
}

impl ExperimentConfig {
    /// Where the raw levels come from, for logging.
    pub fn source(&self) -> String {
        match (&self.command_sequence_path, &self.triangular) {
            (Some(path), _) => path.display().to_string(),
            (None, Some(wave)) => format!(
                "triangular wave ({} harmonics, rise {:?}, period {:?})",
                wave.harmonics, wave.rise_time, wave.period
            ),
            (None, None) => "none".to_string(),
        }
    }
}

/// `[experiment.triangular]`: a truncated Fourier series of a unit triangular wave,
/// sampled at the experiment period and shaped like a file of raw levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangularConfig {
    /// Harmonics kept in the series
    #[serde(default = "default_harmonics")]
    pub harmonics: usize,
    /// Time from the low to the high corner
    #[serde(with = "humantime_serde")]
    pub rise_time: Duration,
    /// Period of the wave, not of the poll loop
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Samples before shaping
    pub samples: usize,
}

fn default_harmonics() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_endpoint() -> String {
    "sim://placa".to_string()
}

fn default_channel_timeout() -> Option<Duration> {
    Some(Duration::from_secs(2))
}

fn default_max_session_retries() -> u32 {
    5
}

fn default_monitor_period() -> Duration {
    Duration::from_millis(200)
}

fn default_refresh() -> Duration {
    Duration::from_secs(2)
}

fn default_window_size() -> usize {
    2000
}

fn default_experiment_period() -> Duration {
    Duration::from_secs(2)
}

fn default_experiment_output() -> PathBuf {
    PathBuf::from("dados_processo.csv")
}

impl Config {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file, with environment overrides on top.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DaqError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        Self::from_figment(Figment::new().merge(Toml::file(path)))
    }

    /// Parse TOML text, with environment overrides on top.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.application.log_level)?;

        if self.session.endpoint.trim().is_empty() {
            return Err(DaqError::Configuration("session.endpoint is empty".to_string()));
        }
        if self.session.channel_timeout.is_some_and(|t| t.is_zero()) {
            return Err(DaqError::Configuration(
                "session.channel_timeout must be positive".to_string(),
            ));
        }

        if self.channels.is_empty() {
            return Err(DaqError::Configuration("No channels configured".to_string()));
        }
        let mut ids = HashSet::new();
        for channel in &self.channels {
            if channel.id.trim().is_empty() {
                return Err(DaqError::Configuration("Channel with empty id".to_string()));
            }
            if channel.node().trim().is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Channel '{}' has an empty node id",
                    channel.id
                )));
            }
            if !ids.insert(channel.id.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate channel ID: {}",
                    channel.id
                )));
            }
        }

        if self.monitor.period.is_zero() || self.monitor.refresh.is_zero() {
            return Err(DaqError::Configuration(
                "monitor.period and monitor.refresh must be positive".to_string(),
            ));
        }
        if self.monitor.window_size == 0 {
            return Err(DaqError::Configuration(
                "monitor.window_size must be at least 1".to_string(),
            ));
        }

        if let Some(experiment) = &self.experiment {
            if experiment.period.is_zero() {
                return Err(DaqError::Configuration(
                    "experiment.period must be positive".to_string(),
                ));
            }
            match (&experiment.command_sequence_path, &experiment.triangular) {
                (Some(path), None) if path.as_os_str().is_empty() => {
                    return Err(DaqError::Configuration(
                        "experiment.command_sequence_path is empty".to_string(),
                    ));
                }
                (Some(_), None) => {}
                (None, Some(wave)) => {
                    if wave.samples == 0 || wave.harmonics == 0 {
                        return Err(DaqError::Configuration(
                            "experiment.triangular needs at least one sample and one harmonic"
                                .to_string(),
                        ));
                    }
                    if wave.rise_time.is_zero() || wave.rise_time >= wave.period {
                        return Err(DaqError::Configuration(
                            "experiment.triangular.rise_time must be within (0, period)"
                                .to_string(),
                        ));
                    }
                }
                (Some(_), Some(_)) => {
                    return Err(DaqError::Configuration(
                        "experiment.command_sequence_path and experiment.triangular are exclusive"
                            .to_string(),
                    ));
                }
                (None, None) => {
                    return Err(DaqError::Configuration(
                        "experiment needs command_sequence_path or a [experiment.triangular] table"
                            .to_string(),
                    ));
                }
            }
            if !self.channels.iter().any(Channel::is_write) {
                return Err(DaqError::Configuration(
                    "An experiment needs at least one write channel".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Effective configuration after all layers, as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| {
            DaqError::Configuration(format!("Cannot render configuration: {e}"))
        })
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.id.clone()).collect()
    }

    /// Store settings for live monitoring.
    pub fn monitor_store(&self) -> StoreConfig {
        StoreConfig::default()
            .with_window(self.monitor.window_size)
            .with_time_base(self.monitor.time_base)
    }

    /// Poll settings for live monitoring.
    pub fn monitor_poll(&self) -> PollConfig {
        self.poll_config(self.monitor.period, PollMode::Monitor)
    }

    /// Poll settings for the experiment, with the command sequence loaded (or
    /// synthesised) and shaped.
    pub fn experiment_poll(&self) -> AppResult<PollConfig> {
        let experiment = self.experiment()?;
        let raw = match (&experiment.command_sequence_path, &experiment.triangular) {
            (Some(path), _) => CommandSequence::load(path)?,
            (None, Some(wave)) => triangular::synthesize(
                wave.harmonics,
                wave.rise_time.as_secs_f64(),
                wave.period.as_secs_f64(),
                experiment.period.as_secs_f64(),
                wave.samples,
                (0.0, 1.0),
            )?,
            (None, None) => {
                return Err(DaqError::Configuration(
                    "No excitation source configured".to_string(),
                ))
            }
        };
        let sequence = raw.shape(&experiment.shaping);
        Ok(self.poll_config(experiment.period, PollMode::Experiment(sequence)))
    }

    /// The `[experiment]` section.
    pub fn experiment(&self) -> AppResult<&ExperimentConfig> {
        self.experiment.as_ref().ok_or_else(|| {
            DaqError::Configuration("No [experiment] section configured".to_string())
        })
    }

    fn poll_config(&self, period: Duration, mode: PollMode) -> PollConfig {
        PollConfig {
            channels: self.channels.clone(),
            period,
            mode,
            channel_timeout: self.session.channel_timeout,
            max_session_retries: self.session.max_session_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
        [[channels]]
        id = "PV1"
        direction = "read"

        [[channels]]
        id = "MV1"
        direction = "write"
    "#;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.endpoint, "sim://placa");
        assert_eq!(config.monitor.period, Duration::from_millis(200));
        assert_eq!(config.monitor.window_size, 2000);
        assert_eq!(config.session.reconnect, ReconnectPolicy::default());
        assert!(config.experiment.is_none());
    }

    #[test]
    fn humantime_durations_parse() {
        let toml = format!(
            r#"
            [session]
            channel_timeout = "750ms"
            [session.reconnect]
            max_attempts = 1
            initial_delay = "1s"
            backoff_multiplier = 1.0
            [monitor]
            period = "1s"
            {MINIMAL}
            "#
        );
        let config = Config::from_toml_str(&toml).unwrap();
        assert_eq!(config.session.channel_timeout, Some(Duration::from_millis(750)));
        assert_eq!(config.session.reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(config.monitor_poll().period, Duration::from_secs(1));
    }

    #[test]
    fn test_duplicate_channel_ids() {
        let toml = format!("{MINIMAL}\n[[channels]]\nid = \"PV1\"\ndirection = \"read\"\n");
        let config = Config::from_toml_str(&toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate channel ID"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.application.log_level = "chatty".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_window_is_rejected() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.monitor.window_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn experiment_requires_a_write_channel() {
        let toml = r#"
            [[channels]]
            id = "PV1"
            direction = "read"
            [experiment]
            command_sequence_path = "prbs.txt"
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn experiment_sequence_is_loaded_and_shaped() {
        let mut prbs = NamedTempFile::new().unwrap();
        writeln!(prbs, "0\n1").unwrap();
        let toml = format!(
            r#"
            {MINIMAL}
            [experiment]
            period = "1s"
            command_sequence_path = "{}"
            pre_roll = 1
            "#,
            prbs.path().display()
        );
        let config = Config::from_toml_str(&toml).unwrap();
        config.validate().unwrap();

        let poll = config.experiment_poll().unwrap();
        match poll.mode {
            PollMode::Experiment(sequence) => {
                assert_eq!(sequence.values(), &[20.0, 10.0, 30.0, 0.0]);
            }
            PollMode::Monitor => panic!("expected experiment mode"),
        }
    }

    #[test]
    fn triangular_source_is_synthesised_and_shaped() {
        let toml = format!(
            r#"
            {MINIMAL}
            [experiment]
            period = "1s"
            pre_roll = 0
            [experiment.triangular]
            harmonics = 200
            rise_time = "3s"
            period = "10s"
            samples = 10
            "#
        );
        let config = Config::from_toml_str(&toml).unwrap();
        config.validate().unwrap();
        assert!(config.experiment().unwrap().source().starts_with("triangular"));

        let PollMode::Experiment(sequence) = config.experiment_poll().unwrap().mode else {
            panic!("expected experiment mode");
        };
        // Ten samples plus the final command; the wave starts at its low corner
        // and peaks at the end of the rise.
        assert_eq!(sequence.len(), 11);
        let low = 20.0 + 20.0 * (0.0 - 0.5);
        let high = 20.0 + 20.0 * (1.0 - 0.5);
        assert!((sequence.get(0).unwrap() - low).abs() < 0.5);
        assert!((sequence.get(3).unwrap() - high).abs() < 0.5);
        assert_eq!(sequence.get(10), Some(0.0));
    }

    #[test]
    fn experiment_needs_exactly_one_source() {
        let neither = format!("{MINIMAL}\n[experiment]\nperiod = \"1s\"\n");
        let config = Config::from_toml_str(&neither).unwrap();
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));

        let both = format!(
            r#"
            {MINIMAL}
            [experiment]
            command_sequence_path = "prbs.txt"
            [experiment.triangular]
            rise_time = "3s"
            period = "10s"
            samples = 5
            "#
        );
        let config = Config::from_toml_str(&both).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("exclusive"));

        let bad_rise = format!(
            r#"
            {MINIMAL}
            [experiment.triangular]
            rise_time = "10s"
            period = "10s"
            samples = 5
            "#
        );
        let config = Config::from_toml_str(&bad_rise).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn effective_config_renders_as_toml() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("endpoint = \"sim://placa\""));
        assert!(rendered.contains("period = \"200ms\""));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::load_from("/nonexistent/peltier.toml").unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }
}
