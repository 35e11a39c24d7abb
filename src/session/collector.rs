//! Live session collection
//!
//! A [`SessionCollector`] follows one probe and copies every newly recorded
//! cycle into its session until the target entry count is reached.
//! Three collection modes exist:
//!
//! | mode                       | one recorded cycle becomes                 |
//! |----------------------------|--------------------------------------------|
//! | default                    | one row (duration, calls)                  |
//! | `only_entries_with_values` | one row, or nothing if the cycle had no calls |
//! | `entry_per_call`           | `calls` rows of `duration / calls`, no call column |

use super::{Result, Session, SessionError, SessionHeader, MAGIC, NO_LABEL};
use crate::config::{MAX_TARGET_ENTRIES, MIN_TARGET_ENTRIES};
use crate::probe::Probe;
use crate::registry::SlotId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Options of one collection run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub target_entries: i32,
    pub only_entries_with_values: bool,
    pub entry_per_call: bool,
    pub custom_name: Option<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            target_entries: 2000,
            only_entries_with_values: false,
            entry_per_call: false,
            custom_name: None,
        }
    }
}

impl CollectionConfig {
    /// Reuse the settings of a previously saved session
    pub fn from_header(header: &SessionHeader) -> Self {
        Self {
            target_entries: header.target_entries,
            only_entries_with_values: header.only_entries_with_values,
            entry_per_call: header.entry_per_call,
            custom_name: (header.custom_label != NO_LABEL && !header.custom_label.is_empty())
                .then(|| header.custom_label.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectionStatus {
    Idle,
    Collecting { entries: i32, target: i32 },
    Completed,
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionStatus::Idle => write!(f, "Idle"),
            CollectionStatus::Collecting { entries, target } => write!(
                f,
                "Collecting Entries {}/{} ({:.2}%)",
                entries,
                target,
                f64::from(*entries) / f64::from((*target).max(1)) * 100.0
            ),
            CollectionStatus::Completed => write!(f, "Completed Collection"),
        }
    }
}

/// Correct a header that is about to start a collection.
///
/// Returns the number of fields that had to be repaired.
pub fn repair_header(header: &mut SessionHeader) -> usize {
    let mut repaired = 0;
    if header.magic != MAGIC {
        error!(
            "Header magic was {} not the expected {}; correcting",
            header.magic, MAGIC
        );
        header.magic = MAGIC;
        repaired += 1;
    }
    if header.entries != 0 {
        error!("Header entries was {} not 0; resetting", header.entries);
        header.entries = 0;
        repaired += 1;
    }
    if header.custom_label.is_empty() {
        error!("Header label was empty, should have been '{}'; resetting", NO_LABEL);
        header.custom_label = NO_LABEL.to_string();
        repaired += 1;
    }
    repaired
}

pub struct SessionCollector {
    slot: SlotId,
    probe: Arc<Probe>,
    header: SessionHeader,
    durations: Vec<f64>,
    calls: Option<Vec<i32>>,
    /// Probe cycle count already consumed
    seen: u64,
}

impl SessionCollector {
    /// Start collecting from `probe` with `config`
    pub fn new(slot: SlotId, probe: Arc<Probe>, config: &CollectionConfig) -> Self {
        let header = SessionHeader {
            custom_label: config
                .custom_name
                .clone()
                .unwrap_or_else(|| NO_LABEL.to_string()),
            entry_per_call: config.entry_per_call,
            only_entries_with_values: config.only_entries_with_values,
            target_entries: config.target_entries,
            ..SessionHeader::new(probe.label())
        };
        Self::from_header(slot, probe, header)
    }

    /// Start collecting with a header template (e.g. copied from an earlier
    /// session). The header is repaired and retargeted at `probe`.
    pub fn from_header(slot: SlotId, probe: Arc<Probe>, mut header: SessionHeader) -> Self {
        repair_header(&mut header);
        header.target_name = probe.label().to_string();

        let clamped = header
            .target_entries
            .clamp(MIN_TARGET_ENTRIES, MAX_TARGET_ENTRIES);
        if clamped != header.target_entries {
            warn!(
                "Target entries {} outside [{}, {}]; using {}",
                header.target_entries, MIN_TARGET_ENTRIES, MAX_TARGET_ENTRIES, clamped
            );
            header.target_entries = clamped;
        }

        let capacity = header.target_entries as usize;
        let calls = (!header.entry_per_call).then(|| Vec::with_capacity(capacity));
        info!(
            "Collecting {} entries from '{}'",
            header.target_entries,
            probe.label()
        );

        Self {
            slot,
            seen: probe.recorded_cycles(),
            probe,
            header,
            durations: Vec::with_capacity(capacity),
            calls,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn entries(&self) -> i32 {
        self.durations.len() as i32
    }

    pub fn is_complete(&self) -> bool {
        self.entries() >= self.header.target_entries
    }

    pub fn status(&self) -> CollectionStatus {
        if self.is_complete() {
            CollectionStatus::Completed
        } else {
            CollectionStatus::Collecting {
                entries: self.entries(),
                target: self.header.target_entries,
            }
        }
    }

    /// Copy the cycles recorded since the last update
    pub fn update(&mut self) -> CollectionStatus {
        let recorded = self.probe.recorded_cycles();
        let fresh = recorded.saturating_sub(self.seen) as usize;
        self.seen = recorded;

        if fresh > self.probe.capacity() {
            warn!(
                "{} cycles of '{}' were overwritten before collection",
                fresh - self.probe.capacity(),
                self.probe.label()
            );
        }

        let mut samples = self.probe.samples(fresh);
        samples.reverse();
        for sample in samples {
            if self.is_complete() {
                break;
            }
            self.push_cycle(sample.duration_ms, sample.calls);
        }
        self.header.entries = self.entries();

        if self.is_complete() {
            info!("Collection for '{}' complete", self.probe.label());
        }
        self.status()
    }

    fn push_cycle(&mut self, duration_ms: f64, calls: u32) {
        let remaining = (self.header.target_entries - self.entries()).max(0) as usize;

        if self.header.entry_per_call {
            let rows = (calls as usize).min(remaining);
            if rows == 0 {
                return;
            }
            let per_call = duration_ms / f64::from(calls);
            self.durations.extend(std::iter::repeat(per_call).take(rows));
            return;
        }

        if self.header.only_entries_with_values && calls == 0 {
            return;
        }
        self.durations.push(duration_ms);
        if let Some(column) = self.calls.as_mut() {
            column.push(calls.min(i32::MAX as u32) as i32);
        }
    }

    /// Session holding the rows collected so far
    pub fn snapshot(&self) -> Result<Session> {
        if self.durations.is_empty() {
            return Err(SessionError::NoSamples);
        }
        let mut header = self.header.clone();
        header.entries = self.entries();
        Ok(Session {
            header,
            durations: self.durations.clone(),
            calls: self.calls.clone(),
        })
    }
}
