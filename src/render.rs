//! Timer-driven consumers of the sample store.
//!
//! A render loop never touches the session. Every `refresh` it takes one
//! [`StoreSnapshot`] and hands it to a [`RenderSink`], so a slow consumer only delays
//! its own next frame and never the poll loop.

use crate::data::store::{SampledChannelStore, StoreSnapshot};
use crate::poll::CancelToken;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Consumer of periodic snapshots (a plot, a dashboard, a log line).
pub trait RenderSink: Send {
    /// Draw one snapshot. Called from the refresh timer, never from the poll loop.
    fn render(&mut self, snapshot: &StoreSnapshot);
}

/// Logs the latest value of every channel.
#[derive(Debug, Default)]
pub struct LogRenderSink {
    frames: usize,
}

impl LogRenderSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames rendered so far.
    pub fn frames(&self) -> usize {
        self.frames
    }
}

impl RenderSink for LogRenderSink {
    fn render(&mut self, snapshot: &StoreSnapshot) {
        self.frames += 1;
        if snapshot.is_empty() {
            debug!("No samples yet");
            return;
        }
        let latest = snapshot
            .channel_ids()
            .iter()
            .map(|id| match snapshot.latest(id) {
                Some(v) => format!("{id}={v:.2}"),
                None => format!("{id}=-"),
            })
            .collect::<Vec<_>>()
            .join(" ");
        let t = snapshot.timestamps().last().copied().unwrap_or_default();
        info!(samples = snapshot.len(), "t={t:.1}s | {latest}");
    }
}

/// Feed `sink` a snapshot of `store` every `refresh` until `cancel` fires.
///
/// The first frame is rendered immediately. Missed ticks are skipped rather than
/// replayed. The sink is handed back when the task ends.
pub fn spawn_render_loop<S>(
    store: Arc<SampledChannelStore>,
    mut sink: S,
    refresh: Duration,
    cancel: CancelToken,
) -> JoinHandle<S>
where
    S: RenderSink + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => sink.render(&store.snapshot()),
                _ = cancel.cancelled() => break,
            }
        }
        debug!("Render loop stopped");
        sink
    })
}
