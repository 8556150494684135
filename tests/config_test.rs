//! Integration tests for the shipped configuration file.

use peltier_daq::config::{Config, DEFAULT_CONFIG_PATH};
use peltier_daq::core::Direction;
use peltier_daq::logging::OutputFormat;
use peltier_daq::poll::PollMode;
use std::time::Duration;

fn load_default() -> Config {
    Config::load_from(DEFAULT_CONFIG_PATH).expect("Failed to load shipped configuration")
}

#[test]
fn test_shipped_config_is_valid() {
    let config = load_default();
    config.validate().expect("Shipped configuration should validate");

    assert_eq!(config.application.log_format, OutputFormat::Pretty);
    assert_eq!(config.channel_ids(), vec!["PV1", "PV2", "CMD", "MV1", "MV2"]);
    let writes: Vec<_> = config
        .channels
        .iter()
        .filter(|c| c.direction == Direction::Write)
        .collect();
    assert_eq!(writes.len(), 1);
    assert!(writes[0].node().ends_with("Malha2.MV"));
}

#[test]
fn test_monitor_settings() {
    let config = load_default();
    let poll = config.monitor_poll();

    assert_eq!(poll.period, Duration::from_millis(200));
    assert_eq!(poll.channel_timeout, Some(Duration::from_secs(2)));
    assert!(matches!(poll.mode, PollMode::Monitor));
    assert_eq!(config.monitor_store().window_size, Some(2000));
    assert_eq!(config.monitor.refresh, Duration::from_secs(2));
}

#[test]
fn test_experiment_sequence_is_shaped() {
    let config = load_default();
    let poll = config.experiment_poll().expect("Failed to load command sequence");

    let PollMode::Experiment(sequence) = poll.mode else {
        panic!("expected experiment mode");
    };
    // Ten samples of pre-roll at the operating point, the excitation, then 0.
    assert_eq!(&sequence.values()[..10], &[20.0; 10]);
    assert_eq!(sequence.values().last(), Some(&0.0));
    assert!(sequence.values()[10..sequence.len() - 1]
        .iter()
        .all(|v| *v == 10.0 || *v == 30.0));
    assert_eq!(poll.period, Duration::from_secs(2));
}
