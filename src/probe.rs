//! Per-slot measurement state
//!
//! A [`Probe`] times the bracketed body of one slot. `start`/`stop` pairs add
//! into the current cycle's bucket; [`Probe::record_measurement`], called once
//! per external cycle, moves that bucket into a fixed-capacity circular buffer.
//!
//! ```text
//!   start ─► stop ─► start ─► stop        record_measurement()
//!   └──── cycle bucket: Σms, calls ────┘ ──────────► buffer[cursor]
//!                                                    cursor = (cursor+1) % capacity
//! ```
//!
//! All state is atomic so the aggregator can read while the hot path writes.
//! Contention on one probe from several threads is tolerated, not ordered:
//! statistics are approximate and eventually consistent.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

const NOT_STARTED: u64 = u64::MAX;

/// Start/stop pairing violations. Both are non-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe '{label}' started while already running; start time overwritten")]
    ReentrantStart { label: String },

    #[error("probe '{label}' stopped without a matching start")]
    UnmatchedStop { label: String },
}

/// Statistics over a window of recorded cycles (milliseconds)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProbeStats {
    /// Total duration / total calls, 0 when no calls were recorded
    pub mean: f64,
    /// Largest single-cycle duration
    pub max: f64,
    /// Sum of durations
    pub total: f64,
    /// Sum of calls
    pub calls: u64,
    /// Number of cycles the statistics were computed over
    pub window: usize,
}

/// One recorded cycle
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sample {
    pub duration_ms: f64,
    pub calls: u32,
}

#[derive(Debug)]
pub struct Probe {
    label: String,
    capacity: usize,

    start_ns: AtomicU64,
    cycle_ns: AtomicU64,
    cycle_calls: AtomicU32,

    /// f64 milliseconds stored as bits
    durations: Box<[AtomicU64]>,
    calls: Box<[AtomicU32]>,
    cursor: AtomicUsize,
    /// Recorded cycles, capped at `capacity`
    elapsed: AtomicUsize,
    /// Recorded cycles, uncapped
    recorded: AtomicU64,
}

impl Probe {
    pub fn new(label: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            label: label.into(),
            capacity,
            start_ns: AtomicU64::new(NOT_STARTED),
            cycle_ns: AtomicU64::new(0),
            cycle_calls: AtomicU32::new(0),
            durations: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            calls: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            cursor: AtomicUsize::new(0),
            elapsed: AtomicUsize::new(0),
            recorded: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cycles currently held in the buffer
    pub fn elapsed_cycles(&self) -> usize {
        self.elapsed.load(Ordering::Acquire)
    }

    /// Cycles recorded since creation
    pub fn recorded_cycles(&self) -> u64 {
        self.recorded.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.start_ns.load(Ordering::Acquire) != NOT_STARTED
    }

    /// Mark the start of a timed call at clock reading `now`.
    ///
    /// Starting a running probe overwrites the stored start and reports
    /// [`ProbeError::ReentrantStart`].
    #[inline]
    pub fn start(&self, now: Duration) -> Result<(), ProbeError> {
        let now = now.as_nanos() as u64;
        let previous = self.start_ns.swap(now, Ordering::AcqRel);
        if previous != NOT_STARTED {
            return Err(ProbeError::ReentrantStart {
                label: self.label.clone(),
            });
        }
        Ok(())
    }

    /// Close the timed call opened by [`Probe::start`] and add its duration
    /// to the current cycle.
    #[inline]
    pub fn stop(&self, now: Duration) -> Result<(), ProbeError> {
        let started = self.start_ns.swap(NOT_STARTED, Ordering::AcqRel);
        if started == NOT_STARTED {
            return Err(ProbeError::UnmatchedStop {
                label: self.label.clone(),
            });
        }
        let elapsed = (now.as_nanos() as u64).saturating_sub(started);
        self.cycle_ns.fetch_add(elapsed, Ordering::Relaxed);
        self.cycle_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Add one call of `duration` to the current cycle without start/stop
    pub fn accumulate(&self, duration: Duration) {
        self.cycle_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.cycle_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Flush the current cycle into the buffer and advance the cursor
    pub fn record_measurement(&self) {
        let nanos = self.cycle_ns.swap(0, Ordering::AcqRel);
        let calls = self.cycle_calls.swap(0, Ordering::AcqRel);
        self.record_sample(nanos as f64 / 1_000_000.0, calls);
    }

    /// Write one complete cycle into the buffer
    pub fn record_sample(&self, duration_ms: f64, calls: u32) {
        let at = self.cursor.load(Ordering::Acquire);
        self.durations[at].store(duration_ms.to_bits(), Ordering::Relaxed);
        self.calls[at].store(calls, Ordering::Relaxed);
        self.cursor
            .store((at + 1) % self.capacity, Ordering::Release);

        let elapsed = self.elapsed.load(Ordering::Acquire);
        if elapsed < self.capacity {
            self.elapsed.store(elapsed + 1, Ordering::Release);
        }
        self.recorded.fetch_add(1, Ordering::AcqRel);

        trace!(
            probe = %self.label,
            duration_ms,
            calls,
            "cycle recorded"
        );
    }

    /// Most recently recorded cycle
    pub fn latest(&self) -> Option<Sample> {
        self.samples(1).into_iter().next()
    }

    /// Up to `window` most recent cycles, newest first
    pub fn samples(&self, window: usize) -> Vec<Sample> {
        let window = window.min(self.elapsed_cycles()).min(self.capacity);
        let cursor = self.cursor.load(Ordering::Acquire);
        (0..window)
            .map(|back| {
                let at = (cursor + self.capacity - 1 - back) % self.capacity;
                Sample {
                    duration_ms: f64::from_bits(self.durations[at].load(Ordering::Relaxed)),
                    calls: self.calls[at].load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Statistics over the most recent `min(window, elapsed, capacity)` cycles
    pub fn get_statistics(&self, window: usize) -> ProbeStats {
        let samples = self.samples(window);
        let mut stats = ProbeStats {
            window: samples.len(),
            ..ProbeStats::default()
        };

        for sample in &samples {
            stats.total += sample.duration_ms;
            stats.calls += u64::from(sample.calls);
            if sample.duration_ms > stats.max {
                stats.max = sample.duration_ms;
            }
        }
        if stats.calls > 0 {
            stats.mean = stats.total / stats.calls as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: f64) -> Duration {
        Duration::from_secs_f64(v / 1000.0)
    }

    #[test]
    fn test_five_cycles_of_two_ms() {
        let probe = Probe::new("Foo.Bar", 16);
        for cycle in 0..5u64 {
            let t0 = Duration::from_millis(100 * cycle);
            probe.start(t0).unwrap();
            probe.stop(t0 + Duration::from_millis(2)).unwrap();
            probe.record_measurement();
        }

        let stats = probe.get_statistics(5);
        assert_eq!(stats.mean, 2.0);
        assert_eq!(stats.max, 2.0);
        assert_eq!(stats.total, 10.0);
        assert_eq!(stats.calls, 5);
        assert_eq!(stats.window, 5);
    }

    #[test]
    fn test_reentrant_start_overwrites() {
        let probe = Probe::new("p", 4);
        probe.start(Duration::from_millis(1)).unwrap();
        let err = probe.start(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, ProbeError::ReentrantStart { .. }));

        probe.stop(Duration::from_millis(6)).unwrap();
        probe.record_measurement();
        assert_eq!(probe.latest().unwrap().duration_ms, 1.0);
    }

    #[test]
    fn test_unmatched_stop_is_noop() {
        let probe = Probe::new("p", 4);
        let err = probe.stop(Duration::from_millis(3)).unwrap_err();
        assert_eq!(
            err,
            ProbeError::UnmatchedStop {
                label: "p".to_string()
            }
        );
        probe.record_measurement();
        assert_eq!(
            probe.latest(),
            Some(Sample {
                duration_ms: 0.0,
                calls: 0
            })
        );
    }

    #[test]
    fn test_window_clamped_to_elapsed() {
        let probe = Probe::new("p", 8);
        probe.record_sample(3.0, 1);
        probe.record_sample(5.0, 1);
        let stats = probe.get_statistics(100);
        assert_eq!(stats.window, 2);
        assert_eq!(stats.total, 8.0);
        assert_eq!(stats.mean, 4.0);
    }

    #[test]
    fn test_wraparound_keeps_most_recent() {
        let capacity = 10;
        let probe = Probe::new("p", capacity);
        for i in 0..(capacity + 10) {
            probe.record_sample(i as f64, 1);
        }

        assert_eq!(probe.elapsed_cycles(), capacity);
        assert_eq!(probe.recorded_cycles(), (capacity + 10) as u64);

        let stats = probe.get_statistics(capacity);
        // most recent samples are 10..=19
        assert_eq!(stats.total, (10..20).sum::<usize>() as f64);
        assert_eq!(stats.max, 19.0);
        assert_eq!(stats.calls, capacity as u64);
    }

    #[test]
    fn test_samples_newest_first() {
        let probe = Probe::new("p", 3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            probe.record_sample(v, 2);
        }
        let durations: Vec<f64> = probe.samples(3).iter().map(|s| s.duration_ms).collect();
        assert_eq!(durations, vec![4.0, 3.0, 2.0]);
    }

    #[test]
    fn test_mean_zero_without_calls() {
        let probe = Probe::new("p", 4);
        probe.record_measurement();
        probe.record_measurement();
        let stats = probe.get_statistics(2);
        assert_eq!(stats.mean, 0.0);
        assert_eq!(stats.total, 0.0);
    }

    #[test]
    fn test_accumulate_adds_calls_to_cycle() {
        let probe = Probe::new("p", 4);
        probe.accumulate(ms(1.5));
        probe.accumulate(ms(0.5));
        probe.record_measurement();
        let latest = probe.latest().unwrap();
        assert_eq!(latest.calls, 2);
        assert!((latest.duration_ms - 2.0).abs() < 1e-6);
    }
}
