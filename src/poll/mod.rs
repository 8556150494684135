//! The poll loop: one read/write pass over every channel per sampling period.
//!
//! A [`PollLoop`] owns the session for its whole run. Each cycle it
//!
//! 1. writes commands to the write channels (the next element of the experiment's
//!    command sequence, or commands queued through [`PollHandle::command`] when
//!    monitoring),
//! 2. reads every read channel,
//! 3. appends the whole cycle to the shared [`SampledChannelStore`] and, when a sink is
//!    attached, persists it as one row before going on,
//! 4. sleeps for whatever is left of the period.
//!
//! A failure on one channel only costs that channel's sample for the cycle. A lost
//! session costs the whole cycle; the next scheduled cycle retries on the same handle
//! and the loop faults after `max_session_retries` consecutive lost cycles.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = Arc::new(SampledChannelStore::new(ids, StoreConfig::default())?);
//! let poll = PollLoop::new(config, Arc::clone(&store))?;
//! let handle = poll.handle();
//! let task = poll.spawn(Arc::new(SimulatedConnector::default()), "sim://placa".into());
//!
//! tokio::signal::ctrl_c().await?;
//! handle.cancel();
//! let summary = task.await??;
//! ```

use crate::core::{Channel, PollCycleResult};
use crate::data::storage::RowSink;
use crate::data::store::SampledChannelStore;
use crate::error::{AppResult, DaqError};
use crate::session::{Connector, Session};
use crate::signal::CommandSequence;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

pub mod state;

pub use state::LoopState;

/// What drives the loop.
#[derive(Clone, Debug)]
pub enum PollMode {
    /// Poll until cancelled; write only commands queued by the caller.
    Monitor,
    /// Apply one command per cycle to every write channel, then stop.
    Experiment(CommandSequence),
}

/// Poll loop settings.
#[derive(Clone, Debug)]
pub struct PollConfig {
    pub channels: Vec<Channel>,
    pub period: Duration,
    pub mode: PollMode,
    /// Upper bound on a single read or write; exceeding it counts as a channel failure.
    pub channel_timeout: Option<Duration>,
    /// Consecutive cycles lost to session errors before the loop faults.
    pub max_session_retries: u32,
}

impl PollConfig {
    pub fn new(channels: Vec<Channel>, period: Duration, mode: PollMode) -> Self {
        Self {
            channels,
            period,
            mode,
            channel_timeout: None,
            max_session_retries: 5,
        }
    }

    pub fn with_channel_timeout(mut self, timeout: Duration) -> Self {
        self.channel_timeout = Some(timeout);
        self
    }

    pub fn with_max_session_retries(mut self, retries: u32) -> Self {
        self.max_session_retries = retries;
        self
    }

    /// Reject configurations the loop cannot run.
    pub fn validate(&self) -> AppResult<()> {
        if self.channels.is_empty() {
            return Err(DaqError::Configuration("No channels configured".to_string()));
        }
        let mut ids = HashSet::new();
        for channel in &self.channels {
            if channel.id.trim().is_empty() || channel.node().trim().is_empty() {
                return Err(DaqError::Configuration(
                    "Channel ids and nodes must not be empty".to_string(),
                ));
            }
            if !ids.insert(channel.id.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate channel id: {}",
                    channel.id
                )));
            }
        }
        if self.period.is_zero() {
            return Err(DaqError::Configuration(
                "Sampling period must be positive".to_string(),
            ));
        }
        if let PollMode::Experiment(sequence) = &self.mode {
            if sequence.is_empty() {
                return Err(DaqError::Configuration(
                    "Experiment command sequence is empty".to_string(),
                ));
            }
            if !self.channels.iter().any(Channel::is_write) {
                return Err(DaqError::Configuration(
                    "Experiment mode needs at least one write channel".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Cooperative cancellation flag shared between the loop and its controllers.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Control surface of a running loop.
#[derive(Clone, Debug)]
pub struct PollHandle {
    cancel: CancelToken,
    state: watch::Receiver<LoopState>,
    commands: mpsc::UnboundedSender<(String, f64)>,
    write_channels: Arc<HashSet<String>>,
}

impl PollHandle {
    /// Ask the loop to stop. It will not start another channel operation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Resolves when the loop reaches a terminal state.
    pub async fn finished(&self) -> LoopState {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(LoopState::is_terminal).await;
        let state = *rx.borrow();
        state
    }

    /// Queue a value for a write channel; it is sent at the start of the next cycle.
    pub fn command(&self, channel_id: &str, value: f64) -> AppResult<()> {
        if !self.write_channels.contains(channel_id) {
            return Err(DaqError::UnknownChannel(channel_id.to_string()));
        }
        self.commands
            .send((channel_id.to_string(), value))
            .map_err(|_| DaqError::Session("Poll loop is no longer running".to_string()))
    }
}

/// Counters reported when a run ends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Cycles appended to the store.
    pub cycles: usize,
    /// Cycles that took longer than the period.
    pub overruns: usize,
    /// Cycles dropped because the session was lost.
    pub lost_cycles: usize,
}

enum CycleOutcome {
    Completed(PollCycleResult),
    Cancelled,
    SessionLost(DaqError),
}

/// Fixed-period polling driver.
pub struct PollLoop {
    config: PollConfig,
    store: Arc<SampledChannelStore>,
    sink: Option<Box<dyn RowSink>>,
    cancel: CancelToken,
    state: watch::Sender<LoopState>,
    commands_tx: mpsc::UnboundedSender<(String, f64)>,
    commands_rx: mpsc::UnboundedReceiver<(String, f64)>,
    pending: HashMap<String, f64>,
    held: HashMap<String, f64>,
}

impl PollLoop {
    /// Build a loop feeding `store`.
    ///
    /// # Errors
    ///
    /// `DaqError::Configuration` if the configuration is invalid or names a channel the
    /// store does not hold.
    pub fn new(config: PollConfig, store: Arc<SampledChannelStore>) -> AppResult<Self> {
        config.validate()?;
        if let Some(missing) = config
            .channels
            .iter()
            .find(|c| !store.channel_ids().contains(&c.id))
        {
            return Err(DaqError::Configuration(format!(
                "Channel '{}' is not held by the sample store",
                missing.id
            )));
        }

        let (state, _) = watch::channel(LoopState::Idle);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            store,
            sink: None,
            cancel: CancelToken::new(),
            state,
            commands_tx,
            commands_rx,
            pending: HashMap::new(),
            held: HashMap::new(),
        })
    }

    /// Persist every cycle to `sink`.
    pub fn with_sink(mut self, sink: Box<dyn RowSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Share an existing cancellation token, e.g. one wired to Ctrl+C.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn handle(&self) -> PollHandle {
        let write_channels = self
            .config
            .channels
            .iter()
            .filter(|c| c.is_write())
            .map(|c| c.id.clone())
            .collect();
        PollHandle {
            cancel: self.cancel.clone(),
            state: self.state.subscribe(),
            commands: self.commands_tx.clone(),
            write_channels: Arc::new(write_channels),
        }
    }

    /// Run on a new tokio task.
    pub fn spawn(
        self,
        connector: Arc<dyn Connector>,
        endpoint: String,
    ) -> JoinHandle<AppResult<RunSummary>> {
        tokio::spawn(async move { self.run(connector.as_ref(), &endpoint).await })
    }

    fn set_state(&self, next: LoopState) {
        let current = *self.state.borrow();
        if !current.can_transition_to(next) {
            warn!(%current, %next, "Unexpected poll loop transition");
        }
        self.state.send_replace(next);
        debug!(state = %next, "Poll loop state");
    }

    /// Connect, poll until done, and shut down.
    ///
    /// Returns the run counters on a clean stop. Session and persistence failures that
    /// end the run are returned as errors after the sink has been finished and the
    /// session closed.
    #[instrument(skip(self, connector), fields(mode = self.mode_name()))]
    pub async fn run(mut self, connector: &dyn Connector, endpoint: &str) -> AppResult<RunSummary> {
        self.set_state(LoopState::Connecting);
        info!(endpoint, "Connecting");
        let mut session = match connector.connect(endpoint).await {
            Ok(session) => session,
            Err(e) => {
                error!(endpoint, error = %e, "Handshake failed");
                self.finish_sink();
                self.set_state(LoopState::Faulted);
                return Err(e);
            }
        };

        self.set_state(LoopState::Running);
        let outcome = self.poll(session.as_mut()).await;

        match &outcome {
            Ok(_) => self.set_state(LoopState::Stopping),
            Err(e) => error!(error = %e, "Poll loop faulted"),
        }
        let finished = self.finish_sink();
        if let Err(e) = session.disconnect().await {
            warn!(error = %e, "Disconnect failed");
        }

        match (outcome, finished) {
            (Ok(summary), Ok(())) => {
                self.set_state(LoopState::Stopped);
                info!(
                    cycles = summary.cycles,
                    overruns = summary.overruns,
                    lost_cycles = summary.lost_cycles,
                    "Poll loop stopped"
                );
                Ok(summary)
            }
            (Ok(_), Err(e)) | (Err(e), _) => {
                self.set_state(LoopState::Faulted);
                Err(e)
            }
        }
    }

    fn mode_name(&self) -> &'static str {
        match self.config.mode {
            PollMode::Monitor => "monitor",
            PollMode::Experiment(_) => "experiment",
        }
    }

    fn finish_sink(&mut self) -> AppResult<()> {
        match self.sink.as_mut().map(|sink| sink.finish()) {
            Some(Err(e)) => {
                error!(error = %e, "Failed to finish recording");
                Err(e)
            }
            _ => Ok(()),
        }
    }

    async fn poll(&mut self, session: &mut dyn Session) -> AppResult<RunSummary> {
        let started = Instant::now();
        let period = self.config.period;
        let total = match &self.config.mode {
            PollMode::Experiment(sequence) => Some(sequence.len()),
            PollMode::Monitor => None,
        };
        let mut summary = RunSummary::default();
        let mut cursor = 0usize;
        let mut consecutive_lost = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                info!(cycles = summary.cycles, "Cancellation requested");
                break;
            }

            let t_start = Instant::now();
            match self.cycle(session, cursor).await {
                CycleOutcome::Cancelled => {
                    info!(cycles = summary.cycles, "Cancelled mid-cycle; cycle discarded");
                    break;
                }
                CycleOutcome::SessionLost(e) => {
                    consecutive_lost += 1;
                    summary.lost_cycles += 1;
                    if consecutive_lost > self.config.max_session_retries {
                        return Err(DaqError::Session(format!(
                            "gave up after {consecutive_lost} consecutive lost cycles: {e}"
                        )));
                    }
                    warn!(error = %e, retry = consecutive_lost, "Session lost, retrying next cycle");
                }
                CycleOutcome::Completed(cycle) => {
                    consecutive_lost = 0;
                    let relative = cycle.at.saturating_duration_since(started).as_secs_f64();
                    self.persist(relative, &cycle)?;
                    self.log_cycle(relative, cursor, total, &cycle);
                    self.store.append(cycle)?;
                    summary.cycles += 1;
                    cursor += 1;
                    if total.is_some_and(|total| cursor >= total) {
                        info!(cycles = summary.cycles, "Command sequence exhausted");
                        break;
                    }
                }
            }

            let elapsed = t_start.elapsed();
            if elapsed > period {
                summary.overruns += 1;
                warn!(?elapsed, ?period, "Cycle overran its period");
                continue;
            }
            tokio::select! {
                _ = sleep_until(t_start + period) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
        Ok(summary)
    }

    fn persist(&mut self, relative: f64, cycle: &PollCycleResult) -> AppResult<()> {
        let experiment = matches!(self.config.mode, PollMode::Experiment(_));
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        match sink.write_row(relative, cycle) {
            Ok(()) => Ok(()),
            Err(e) if experiment => Err(e),
            Err(e) => {
                warn!(error = %e, "Failed to persist cycle; continuing");
                Ok(())
            }
        }
    }

    fn log_cycle(&self, relative: f64, cursor: usize, total: Option<usize>, cycle: &PollCycleResult) {
        let values = self
            .config
            .channels
            .iter()
            .map(|c| match cycle.value(&c.id) {
                Some(v) => format!("{}={v:.2}", c.id),
                None => format!("{}=-", c.id),
            })
            .collect::<Vec<_>>()
            .join(" ");
        match total {
            Some(total) => info!("[{}/{}] t={relative:.1}s | {values}", cursor + 1, total),
            None => debug!("t={relative:.1}s | {values}"),
        }
    }

    async fn cycle(&mut self, session: &mut dyn Session, cursor: usize) -> CycleOutcome {
        let mut result = PollCycleResult::new(Instant::now());
        let timeout = self.config.channel_timeout;

        while let Ok((id, value)) = self.commands_rx.try_recv() {
            self.pending.insert(id, value);
        }
        let command = match &self.config.mode {
            PollMode::Experiment(sequence) => sequence.get(cursor),
            PollMode::Monitor => None,
        };

        for channel in self.config.channels.iter().filter(|c| c.is_write()) {
            if self.cancel.is_cancelled() {
                return CycleOutcome::Cancelled;
            }
            let Some(value) = command.or_else(|| self.pending.get(&channel.id).copied()) else {
                result.record(&channel.id, self.held.get(&channel.id).copied());
                continue;
            };
            match guarded(timeout, &channel.id, session.write(channel.node(), value)).await {
                Ok(()) => {
                    self.pending.remove(&channel.id);
                    self.held.insert(channel.id.clone(), value);
                    result.record(&channel.id, Some(value));
                }
                Err(e) if e.is_session_level() => return CycleOutcome::SessionLost(e),
                Err(e) => {
                    self.pending.remove(&channel.id);
                    warn!(channel = %channel.id, error = %e, "Write failed");
                    result.record(&channel.id, None);
                }
            }
        }

        for channel in self.config.channels.iter().filter(|c| c.is_read()) {
            if self.cancel.is_cancelled() {
                return CycleOutcome::Cancelled;
            }
            match guarded(timeout, &channel.id, session.read(channel.node())).await {
                Ok(value) => result.record(&channel.id, Some(value)),
                Err(e) if e.is_session_level() => return CycleOutcome::SessionLost(e),
                Err(e) => {
                    warn!(channel = %channel.id, error = %e, "Read failed");
                    result.record(&channel.id, None);
                }
            }
        }

        CycleOutcome::Completed(result)
    }
}

async fn guarded<T>(
    timeout: Option<Duration>,
    channel_id: &str,
    operation: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| DaqError::channel(channel_id, format!("no response within {limit:?}")))?,
        None => operation.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::StoreConfig;
    use crate::session::mock::{MockConnector, MockResponse};
    use tracing_test::traced_test;

    fn store(ids: &[&str]) -> Arc<SampledChannelStore> {
        Arc::new(SampledChannelStore::new(ids.iter().copied(), StoreConfig::default()).unwrap())
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let period = Duration::from_secs(1);
        assert!(PollConfig::new(vec![], period, PollMode::Monitor).validate().is_err());
        assert!(PollConfig::new(vec![Channel::read("A")], Duration::ZERO, PollMode::Monitor)
            .validate()
            .is_err());
        assert!(PollConfig::new(
            vec![Channel::read("A"), Channel::read("A")],
            period,
            PollMode::Monitor
        )
        .validate()
        .is_err());
        assert!(PollConfig::new(
            vec![Channel::read("A")],
            period,
            PollMode::Experiment(vec![1.0].into())
        )
        .validate()
        .is_err());
    }

    #[test]
    fn store_must_hold_every_channel() {
        let config = PollConfig::new(
            vec![Channel::read("A"), Channel::read("B")],
            Duration::from_secs(1),
            PollMode::Monitor,
        );
        let result = PollLoop::new(config, store(&["A"]));
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn commands_only_target_write_channels() {
        let config = PollConfig::new(
            vec![Channel::read("PV"), Channel::write("MV")],
            Duration::from_secs(1),
            PollMode::Monitor,
        );
        let poll = PollLoop::new(config, store(&["PV", "MV"])).unwrap();
        let handle = poll.handle();
        assert!(handle.command("MV", 10.0).is_ok());
        assert!(matches!(handle.command("PV", 10.0), Err(DaqError::UnknownChannel(_))));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn slow_cycles_are_reported_as_overruns() {
        let connector = MockConnector::new()
            .value("A", 1.0)
            .read_delay(Duration::from_millis(150));
        let config = PollConfig::new(
            vec![Channel::read("A"), Channel::write("MV")],
            Duration::from_millis(100),
            PollMode::Experiment(vec![0.0, 0.0, 0.0].into()),
        );

        let summary = PollLoop::new(config, store(&["A", "MV"]))
            .unwrap()
            .run(&connector, "mock://")
            .await
            .unwrap();

        // The last cycle ends the run before its overrun is measured.
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.overruns, 2);
        assert!(logs_contain("Cycle overran its period"));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_holds_last_command() {
        let connector = MockConnector::new().value("PV", 30.0);
        let config = PollConfig::new(
            vec![Channel::read("PV"), Channel::write("MV")],
            Duration::from_secs(1),
            PollMode::Monitor,
        );
        let store = store(&["PV", "MV"]);
        let poll = PollLoop::new(config, Arc::clone(&store)).unwrap();
        let handle = poll.handle();
        handle.command("MV", 55.0).unwrap();
        let task = poll.spawn(Arc::new(connector.clone()), "mock://".to_string());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.cancel();
        task.await.unwrap().unwrap();

        let mv = store.snapshot().values("MV").unwrap();
        assert_eq!(mv, vec![Some(55.0), Some(55.0), Some(55.0)]);
        assert_eq!(connector.writes(), vec![("MV".to_string(), 55.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_session_faults_after_retry_budget() {
        let connector = MockConnector::new().script("A", [MockResponse::SessionLost]);
        let config = PollConfig::new(
            vec![Channel::read("A")],
            Duration::from_secs(1),
            PollMode::Monitor,
        )
        .with_max_session_retries(2);
        let store = store(&["A"]);
        let poll = PollLoop::new(config, Arc::clone(&store)).unwrap();
        let handle = poll.handle();

        let result = poll.run(&connector, "mock://").await;
        assert!(matches!(result, Err(DaqError::Session(_))));
        assert_eq!(handle.state(), LoopState::Faulted);
        assert!(store.is_empty());
        assert_eq!(connector.reads(), 3);
        assert_eq!(connector.disconnects(), 1);
    }

    #[tokio::test]
    async fn failed_handshake_faults_without_polling() {
        let connector = MockConnector::new().fail_connects(1);
        let config = PollConfig::new(
            vec![Channel::read("A")],
            Duration::from_secs(1),
            PollMode::Monitor,
        );
        let poll = PollLoop::new(config, store(&["A"])).unwrap();
        let handle = poll.handle();

        assert!(poll.run(&connector, "mock://").await.is_err());
        assert_eq!(handle.state(), LoopState::Faulted);
        assert_eq!(connector.reads(), 0);
    }
}
