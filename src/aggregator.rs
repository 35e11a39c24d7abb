//! Statistics aggregation and ranking
//!
//! The [`StatsAggregator`] turns the raw cycle buffers of every active probe
//! into [`ProfileLog`]s. Each run rebuilds the list from scratch, ranks it and
//! publishes it with one atomic pointer swap; readers always see a complete,
//! sorted list and never block the aggregator.
//!
//! [`AggregatorWorker`] runs the aggregator on a dedicated thread, either on a
//! wall-clock interval or when signalled by the cycle driver.

use crate::registry::{Registry, SlotId};
use arc_swap::ArcSwap;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicBool, AtomicU64};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Key the published logs are ranked by
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Percent,
    Mean,
    Max,
    Total,
    Name,
}

impl SortKey {
    pub const ALL: [SortKey; 5] = [
        SortKey::Percent,
        SortKey::Mean,
        SortKey::Max,
        SortKey::Total,
        SortKey::Name,
    ];

    /// Ordering of two logs under this key: numeric keys descending with the
    /// label ascending as tie-break, `Name` ascending.
    pub fn compare(&self, a: &ProfileLog, b: &ProfileLog) -> Ordering {
        let numeric = |x: f64, y: f64| y.total_cmp(&x).then_with(|| a.label.cmp(&b.label));
        match self {
            SortKey::Percent => numeric(a.percent, b.percent),
            SortKey::Mean => numeric(a.mean, b.mean),
            SortKey::Max => numeric(a.max, b.max),
            SortKey::Total => numeric(a.total, b.total),
            SortKey::Name => a.label.cmp(&b.label).then_with(|| a.slot.cmp(&b.slot)),
        }
    }
}

/// Immutable per-probe snapshot produced by one aggregation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileLog {
    pub slot: SlotId,
    pub label: String,
    pub mean: f64,
    pub median: f64,
    pub max: f64,
    pub total: f64,
    pub calls: u64,
    /// Share of the summed means of all active probes, 0..=100
    pub percent: f64,
    pub pinned: bool,
}

/// Insert `log` into the already sorted `sorted` at its binary-search position
fn binary_insert(sorted: &mut Vec<ProfileLog>, log: ProfileLog, key: SortKey) {
    let at = sorted.partition_point(|existing| key.compare(existing, &log) != Ordering::Greater);
    sorted.insert(at, log);
}

/// Sort a copy of `logs` by `key` using binary insertion
pub fn rank(logs: &[ProfileLog], key: SortKey) -> Vec<ProfileLog> {
    let mut sorted = Vec::with_capacity(logs.len());
    for log in logs {
        binary_insert(&mut sorted, log.clone(), key);
    }
    sorted
}

/// Middle element of a sorted copy of `values` (upper middle for even counts)
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted[sorted.len() / 2]
}

pub struct StatsAggregator {
    registry: Arc<Registry>,
    sort_key: RwLock<SortKey>,
    pinned: RwLock<BTreeSet<SlotId>>,
    published: ArcSwap<Vec<ProfileLog>>,
    runs: AtomicU64,
}

impl StatsAggregator {
    pub fn new(registry: Arc<Registry>, sort_key: SortKey) -> Self {
        Self {
            registry,
            sort_key: RwLock::new(sort_key),
            pinned: RwLock::new(BTreeSet::new()),
            published: ArcSwap::from_pointee(Vec::new()),
            runs: AtomicU64::new(0),
        }
    }

    pub fn sort_key(&self) -> SortKey {
        *self.sort_key.read()
    }

    /// Change the ranking key; the current list is re-ranked immediately
    pub fn set_sort_key(&self, key: SortKey) {
        *self.sort_key.write() = key;
        let current = self.published.load_full();
        self.published.store(Arc::new(rank(&current, key)));
    }

    pub fn pin(&self, slot: SlotId) {
        self.pinned.write().insert(slot);
    }

    pub fn unpin(&self, slot: SlotId) {
        self.pinned.write().remove(&slot);
    }

    pub fn is_pinned(&self, slot: SlotId) -> bool {
        self.pinned.read().contains(&slot)
    }

    /// Completed aggregation runs
    pub fn runs(&self) -> u64 {
        self.runs.load(atomic::Ordering::Acquire)
    }

    /// Current published list, ranked by the configured key
    pub fn published(&self) -> Arc<Vec<ProfileLog>> {
        self.published.load_full()
    }

    /// Published list ranked by `key`
    pub fn ranked_logs(&self, key: SortKey) -> Vec<ProfileLog> {
        let current = self.published.load_full();
        if key == self.sort_key() {
            current.as_ref().clone()
        } else {
            rank(&current, key)
        }
    }

    /// Rebuild, rank and publish the logs of every active probe
    pub fn run_cycle(&self) -> Arc<Vec<ProfileLog>> {
        let probes = self.registry.active_probes();
        let pinned = self.pinned.read().clone();

        let mut logs = Vec::with_capacity(probes.len());
        let mut sum_of_means = 0.0;

        for (slot, probe) in &probes {
            let window = probe
                .elapsed_cycles()
                .min(probe.capacity().saturating_sub(1));
            let stats = probe.get_statistics(window);
            let durations: Vec<f64> = probe
                .samples(window)
                .iter()
                .map(|s| s.duration_ms)
                .collect();

            sum_of_means += stats.mean;
            logs.push(ProfileLog {
                slot: *slot,
                label: probe.label().to_string(),
                mean: stats.mean,
                median: median(&durations),
                max: stats.max,
                total: stats.total,
                calls: stats.calls,
                percent: 0.0,
                pinned: pinned.contains(slot),
            });
        }

        let key = self.sort_key();
        let mut sorted = Vec::with_capacity(logs.len());
        for mut log in logs {
            log.percent = if sum_of_means > 0.0 {
                log.mean / sum_of_means * 100.0
            } else {
                0.0
            };
            binary_insert(&mut sorted, log, key);
        }

        let sorted = Arc::new(sorted);
        self.published.store(Arc::clone(&sorted));
        self.runs.fetch_add(1, atomic::Ordering::AcqRel);
        trace!("Aggregated {} probe(s)", sorted.len());
        sorted
    }

    /// Drop the published list (cleanup)
    pub fn clear(&self) {
        self.published.store(Arc::new(Vec::new()));
        self.pinned.write().clear();
    }
}

/// Background thread running [`StatsAggregator::run_cycle`]
///
/// With an interval the thread aggregates on every tick; [`AggregatorWorker::signal`]
/// requests an extra run. Without one it only runs when signalled. A panic in a
/// run is caught, logged and does not stop the thread.
pub struct AggregatorWorker {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    signal: Sender<()>,
}

impl AggregatorWorker {
    pub fn spawn(aggregator: Arc<StatsAggregator>, interval: Option<Duration>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (signal, requests) = channel::unbounded();

        let shutdown_clone = shutdown.clone();
        let handle = thread::Builder::new()
            .name("probeweave-aggregator".to_string())
            .spawn(move || Self::worker(aggregator, requests, shutdown_clone, interval))
            .map_err(|e| error!("Failed to spawn aggregator thread: {}", e))
            .ok();

        Self {
            handle,
            shutdown,
            signal,
        }
    }

    /// Request one aggregation run
    pub fn signal(&self) {
        let _ = self.signal.send(());
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn worker(
        aggregator: Arc<StatsAggregator>,
        requests: Receiver<()>,
        shutdown: Arc<AtomicBool>,
        interval: Option<Duration>,
    ) {
        debug!("Aggregator thread started (interval: {:?})", interval);
        loop {
            let wake = match interval {
                Some(period) => requests.recv_timeout(period),
                None => requests.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            if shutdown.load(atomic::Ordering::SeqCst) {
                break;
            }
            if let Err(RecvTimeoutError::Disconnected) = wake {
                break;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| aggregator.run_cycle()));
            if let Err(payload) = outcome {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Aggregation run panicked: {}", message);
            }
        }
        debug!("Aggregator thread stopped");
    }

    /// Stop the thread and wait for it to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, atomic::Ordering::SeqCst);
        let _ = self.signal.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AggregatorWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
