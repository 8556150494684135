//! Bounded, thread-safe time-series store shared by the poll loop and its consumers.
//!
//! The store keeps one sequence per channel on a shared timeline. The only mutation is
//! [`SampledChannelStore::append`], which takes a whole poll cycle at once, so every
//! channel always holds the same number of samples. Readers copy the data out under a
//! read lock with [`SampledChannelStore::snapshot`] and never see half of a cycle.
//!
//! # Example
//!
//! ```
//! use peltier_daq::core::PollCycleResult;
//! use peltier_daq::data::store::{SampledChannelStore, StoreConfig};
//! use tokio::time::Instant;
//!
//! let store = SampledChannelStore::new(["PV1", "MV1"], StoreConfig::default()).unwrap();
//! store
//!     .append(PollCycleResult::new(Instant::now()).with("PV1", Some(24.5)))
//!     .unwrap();
//!
//! let snapshot = store.snapshot();
//! assert_eq!(snapshot.values("PV1"), Some(vec![Some(24.5)]));
//! assert_eq!(snapshot.values("MV1"), Some(vec![None]));
//! ```

use crate::core::{PollCycleResult, Sample};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;

/// Clock used to stamp samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBase {
    /// Seconds since the store was created or last reset.
    #[default]
    Relative,
    /// Unix seconds, anchored to the wall clock at creation or reset.
    WallClock,
}

/// Store construction options.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreConfig {
    /// Keep only the most recent `n` cycles. `None` keeps everything.
    pub window_size: Option<usize>,
    /// Clock used to stamp samples.
    pub time_base: TimeBase,
}

impl StoreConfig {
    /// Bound the store to the latest `window_size` cycles.
    pub fn with_window(mut self, window_size: usize) -> Self {
        self.window_size = Some(window_size);
        self
    }

    /// Select the snapshot time base.
    pub fn with_time_base(mut self, time_base: TimeBase) -> Self {
        self.time_base = time_base;
        self
    }
}

struct Inner {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    timestamps: VecDeque<f64>,
    // Indexed like `SampledChannelStore::channel_ids`.
    series: Vec<VecDeque<Option<f64>>>,
}

impl Inner {
    fn new(channels: usize) -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
            timestamps: VecDeque::new(),
            series: (0..channels).map(|_| VecDeque::new()).collect(),
        }
    }

    fn stamp(&self, at: Instant, time_base: TimeBase) -> f64 {
        let elapsed = at.saturating_duration_since(self.origin).as_secs_f64();
        let stamp = match time_base {
            TimeBase::Relative => elapsed,
            TimeBase::WallClock => {
                self.wall_origin.timestamp() as f64
                    + f64::from(self.wall_origin.timestamp_subsec_nanos()) * 1e-9
                    + elapsed
            }
        };
        // The timeline never runs backwards, even if a caller hands in a stale instant.
        match self.timestamps.back() {
            Some(&last) if stamp < last => last,
            _ => stamp,
        }
    }
}

/// Single-writer, multi-reader sample store.
pub struct SampledChannelStore {
    channel_ids: Vec<String>,
    index: HashMap<String, usize>,
    config: StoreConfig,
    inner: RwLock<Inner>,
}

impl SampledChannelStore {
    /// Create a store for a fixed, ordered set of channels.
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Configuration` for duplicate channel ids or a zero window.
    pub fn new<I, S>(channel_ids: I, config: StoreConfig) -> AppResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channel_ids: Vec<String> = channel_ids.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(channel_ids.len());
        for (i, id) in channel_ids.iter().enumerate() {
            if index.insert(id.clone(), i).is_some() {
                return Err(DaqError::Configuration(format!(
                    "Duplicate channel id: {id}"
                )));
            }
        }
        if config.window_size == Some(0) {
            return Err(DaqError::Configuration(
                "window_size must be greater than 0".to_string(),
            ));
        }

        let inner = RwLock::new(Inner::new(channel_ids.len()));
        Ok(Self {
            channel_ids,
            index,
            config,
            inner,
        })
    }

    /// Channel ids in configuration order.
    pub fn channel_ids(&self) -> &[String] {
        &self.channel_ids
    }

    /// Configured window, if bounded.
    pub fn window_size(&self) -> Option<usize> {
        self.config.window_size
    }

    /// Append one whole cycle.
    ///
    /// Every channel receives exactly one entry stamped with the cycle's instant;
    /// channels missing from `cycle` are recorded as absent. When the window is full
    /// the oldest cycle is dropped from every channel together.
    ///
    /// # Errors
    ///
    /// `DaqError::UnknownChannel` if the cycle names a channel this store was not
    /// created with. The store is left untouched in that case.
    pub fn append(&self, cycle: PollCycleResult) -> AppResult<()> {
        if let Some(unknown) = cycle.channel_ids().find(|id| !self.index.contains_key(*id)) {
            return Err(DaqError::UnknownChannel(unknown.to_string()));
        }

        let mut inner = self.write();
        let stamp = inner.stamp(cycle.at, self.config.time_base);
        inner.timestamps.push_back(stamp);
        for (id, series) in self.channel_ids.iter().zip(inner.series.iter_mut()) {
            series.push_back(cycle.value(id));
        }

        if let Some(window) = self.config.window_size {
            while inner.timestamps.len() > window {
                inner.timestamps.pop_front();
                for series in inner.series.iter_mut() {
                    series.pop_front();
                }
            }
        }
        Ok(())
    }

    /// Copy out the current contents.
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.read();
        let timestamps: Vec<f64> = inner.timestamps.iter().copied().collect();
        let series = self
            .channel_ids
            .iter()
            .zip(inner.series.iter())
            .map(|(id, values)| {
                let samples = timestamps
                    .iter()
                    .zip(values.iter())
                    .map(|(&timestamp, &value)| Sample {
                        timestamp,
                        channel_id: id.clone(),
                        value,
                    })
                    .collect();
                (id.clone(), samples)
            })
            .collect();

        StoreSnapshot {
            channel_ids: self.channel_ids.clone(),
            timestamps,
            series,
        }
    }

    /// Drop every sample and restart the time origin.
    pub fn reset(&self) {
        let mut inner = self.write();
        *inner = Inner::new(self.channel_ids.len());
        tracing::info!(channels = self.channel_ids.len(), "Sample store cleared");
    }

    /// Number of cycles currently held.
    pub fn len(&self) -> usize {
        self.read().timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panicking writer cannot leave a half-applied cycle behind: every append
    // pushes to all sequences before releasing the guard.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Independent copy of the store contents at one moment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreSnapshot {
    channel_ids: Vec<String>,
    timestamps: Vec<f64>,
    series: HashMap<String, Vec<Sample>>,
}

impl StoreSnapshot {
    pub fn channel_ids(&self) -> &[String] {
        &self.channel_ids
    }

    /// Shared timeline, one entry per cycle.
    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    /// Number of cycles in the snapshot.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn channel(&self, id: &str) -> Option<&[Sample]> {
        self.series.get(id).map(Vec::as_slice)
    }

    /// Just the values of one channel, absent entries included.
    pub fn values(&self, id: &str) -> Option<Vec<Option<f64>>> {
        self.channel(id)
            .map(|samples| samples.iter().map(|s| s.value).collect())
    }

    /// Most recent present value of a channel.
    pub fn latest(&self, id: &str) -> Option<f64> {
        self.channel(id)?.iter().rev().find_map(|s| s.value)
    }

    /// Only the cycles within `span` seconds of the newest one.
    pub fn tail_seconds(&self, span: f64) -> StoreSnapshot {
        let Some(&last) = self.timestamps.last() else {
            return self.clone();
        };
        let start = self.timestamps.partition_point(|&t| t < last - span);
        StoreSnapshot {
            channel_ids: self.channel_ids.clone(),
            timestamps: self.timestamps[start..].to_vec(),
            series: self
                .series
                .iter()
                .map(|(id, samples)| (id.clone(), samples[start..].to_vec()))
                .collect(),
        }
    }
}
