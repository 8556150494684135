//! CLI entry point for peltier-daq
//!
//! - `monitor`: poll the plate continuously, log a snapshot every refresh, accept
//!   `<channel> <value>` lines on stdin to command write channels and `reset` to clear
//!   the sample store.
//! - `experiment`: apply the configured excitation sequence and record every cycle.
//! - `inspect`: summarise a recorded CSV.
//!
//! # Usage
//!
//! ```bash
//! peltier-daq monitor --config config/peltier.toml
//! peltier-daq experiment --yes
//! peltier-daq inspect dados_processo2.csv --period 2
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use peltier_daq::config::{Config, DEFAULT_CONFIG_PATH};
use peltier_daq::console::ConsoleCommand;
use peltier_daq::data::storage::CsvRowWriter;
use peltier_daq::logging;
use peltier_daq::poll::{CancelToken, PollHandle, PollLoop, PollMode};
use peltier_daq::render::{spawn_render_loop, LogRenderSink};
use peltier_daq::session::simulated::SimulatedConnector;
use peltier_daq::session::ReconnectingConnector;
use peltier_daq::{SampledChannelStore, StoreConfig};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "peltier-daq")]
#[command(about = "Data acquisition and identification experiments for a Peltier plate", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the plate until Ctrl+C
    Monitor {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Run the configured excitation sequence and record it
    Experiment {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Summarise a recorded CSV file
    Inspect {
        csv: PathBuf,

        /// Sampling period in seconds, for files without a time column
        #[arg(long)]
        period: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Monitor { config } => monitor(load_config(&config)?).await,
        Commands::Experiment { config, yes } => experiment(load_config(&config)?, yes).await,
        Commands::Inspect { csv, period } => {
            logging::init(logging::LoggingConfig::default())?;
            inspect(csv, period)
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    logging::init_from_config(&config)?;
    config.validate()?;
    info!(path = %path.display(), channels = config.channels.len(), "Configuration loaded");
    match config.to_toml() {
        Ok(rendered) => debug!("Effective configuration:\n{rendered}"),
        Err(e) => debug!(error = %e, "Effective configuration unavailable"),
    }
    Ok(config)
}

fn connector(config: &Config) -> Arc<ReconnectingConnector<SimulatedConnector>> {
    Arc::new(ReconnectingConnector::new(
        SimulatedConnector::default(),
        config.session.reconnect.clone(),
    ))
}

/// Cancel `token` on Ctrl+C.
fn cancel_on_ctrl_c(token: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping");
            token.cancel();
        }
    });
}

async fn monitor(config: Config) -> Result<()> {
    let store = Arc::new(SampledChannelStore::new(
        config.channel_ids(),
        config.monitor_store(),
    )?);
    let cancel = CancelToken::new();

    let mut poll = PollLoop::new(config.monitor_poll(), Arc::clone(&store))?
        .with_cancel_token(cancel.clone());
    if let Some(path) = &config.monitor.output_path {
        poll = poll.with_sink(Box::new(CsvRowWriter::create(path, &config.channel_ids())?));
        info!(path = %path.display(), "Recording monitor data");
    }

    spawn_stdin_commands(poll.handle(), Arc::clone(&store));
    cancel_on_ctrl_c(cancel.clone());

    let render = spawn_render_loop(
        Arc::clone(&store),
        LogRenderSink::new(),
        config.monitor.refresh,
        cancel.clone(),
    );
    let run = poll.spawn(connector(&config), config.session.endpoint.clone());

    let result = run.await?;
    cancel.cancel();
    render.await?;

    let summary = result?;
    info!(cycles = summary.cycles, lost = summary.lost_cycles, "Monitor stopped");
    Ok(())
}

/// Apply console lines from stdin to the loop and its store.
///
/// Runs on a plain thread so a pending read never holds up runtime shutdown.
fn spawn_stdin_commands(handle: PollHandle, store: Arc<SampledChannelStore>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match ConsoleCommand::parse(&line) {
                Ok(Some(command)) => {
                    if let Err(e) = command.apply(&handle, &store) {
                        warn!(error = %e, "Command rejected");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Unrecognised console line"),
            }
            if handle.state().is_terminal() {
                break;
            }
        }
    });
}

async fn experiment(config: Config, yes: bool) -> Result<()> {
    let settings = config.experiment()?.clone();
    let poll_config = config.experiment_poll()?;
    if let PollMode::Experiment(sequence) = &poll_config.mode {
        info!(
            samples = sequence.len(),
            period = ?poll_config.period,
            estimated = ?sequence.estimated_duration(poll_config.period),
            source = %settings.source(),
            "Excitation sequence loaded"
        );
    }

    if !yes && !confirm("Start the experiment?")? {
        info!("Experiment cancelled");
        return Ok(());
    }

    let store = Arc::new(SampledChannelStore::new(
        config.channel_ids(),
        StoreConfig::default(),
    )?);
    let sink = CsvRowWriter::create(&settings.output_path, &config.channel_ids())?;
    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let summary = PollLoop::new(poll_config, store)?
        .with_sink(Box::new(sink))
        .with_cancel_token(cancel)
        .spawn(connector(&config), config.session.endpoint.clone())
        .await??;

    info!(
        cycles = summary.cycles,
        overruns = summary.overruns,
        output = %settings.output_path.display(),
        "Experiment finished"
    );
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} (Y/N): ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

#[cfg(feature = "storage_csv")]
fn inspect(path: PathBuf, period: Option<f64>) -> Result<()> {
    use peltier_daq::data::recording::Recording;

    let recording = Recording::load(&path)?;
    if recording.is_empty() {
        bail!("{} has no rows", path.display());
    }
    let duration = recording
        .duration()
        .or_else(|| period.map(|p| p * recording.len().saturating_sub(1) as f64));
    info!(
        path = %path.display(),
        rows = recording.len(),
        duration_s = ?duration,
        "Recording loaded"
    );
    for column in recording.summary() {
        info!(
            column = %column.name,
            present = column.present,
            missing = column.missing,
            min = ?column.min,
            max = ?column.max,
            mean = ?column.mean,
            change = ?column.change,
            "Column"
        );
    }
    Ok(())
}

#[cfg(not(feature = "storage_csv"))]
fn inspect(_path: PathBuf, _period: Option<f64>) -> Result<()> {
    bail!(peltier_daq::DaqError::FeatureNotEnabled("storage_csv".to_string()))
}
