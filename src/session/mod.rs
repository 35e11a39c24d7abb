//! Timing sessions: capture, persistence and comparison
//!
//! A session is a fixed-size run of per-cycle samples taken from one probe,
//! saved to disk so it can be compared against later runs.
//!
//! - [`format`]: bit-exact binary codec
//! - [`store`]: session directory, file naming, atomic saves
//! - [`collector`]: fills a session from a live probe
//! - [`compare`]: summary statistics and delta reports

pub mod collector;
pub mod compare;
pub mod format;
pub mod store;

#[cfg(test)]
mod tests;

pub use collector::{CollectionConfig, CollectionStatus, SessionCollector};
pub use compare::{DeltaClass, DeltaReport, DeltaRow, LogStats, RowValue};
pub use format::{read_header, read_session, write_session};
pub use store::{sanitize_file_name, SessionStore};

use crate::registry::SlotId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Value every intact session header starts with
pub const MAGIC: i32 = 440_985_710;

/// Magic of the sentinel header returned for unreadable files
pub const CORRUPT_MAGIC: i32 = -1;

/// Current file format version
pub const FORMAT_VERSION: i32 = 1;

/// Custom label meaning "no custom label"
pub const NO_LABEL: &str = " ";

/// Errors that can occur while collecting, saving or loading sessions
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{path}: corrupt session file (magic {found})")]
    CorruptFile { path: PathBuf, found: i32 },

    #[error("session holds {entries} entries but targets only {target}")]
    EntriesExceedTarget { entries: i32, target: i32 },

    #[error("session counts are negative (entries {entries}, target {target})")]
    NegativeCount { entries: i32, target: i32 },

    #[error("sample arrays have {found} rows, header declares {expected}")]
    InvalidLength { expected: usize, found: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to persist session file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("session has no samples")]
    NoSamples,

    #[error("no probe for slot {0}")]
    UnknownSlot(SlotId),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub magic: i32,
    pub version: i32,
    /// Label of the probe the samples came from
    pub target_name: String,
    /// Operator-chosen label, `" "` when unset
    pub custom_label: String,
    /// Each sample is exactly one call; no call counts are stored
    pub entry_per_call: bool,
    /// Cycles without calls were skipped during collection
    pub only_entries_with_values: bool,
    pub entries: i32,
    pub target_entries: i32,
}

impl SessionHeader {
    pub fn new(target_name: impl Into<String>) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            target_name: target_name.into(),
            custom_label: NO_LABEL.to_string(),
            entry_per_call: false,
            only_entries_with_values: false,
            entries: 0,
            target_entries: 0,
        }
    }

    /// Sentinel returned for headers that failed validation
    pub fn corrupt() -> Self {
        Self {
            magic: CORRUPT_MAGIC,
            version: 0,
            target_name: String::new(),
            custom_label: String::new(),
            entry_per_call: false,
            only_entries_with_values: false,
            entries: 0,
            target_entries: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
    }

    /// Custom label, falling back to the target name when unset
    pub fn display_name(&self) -> &str {
        if self.custom_label == NO_LABEL || self.custom_label.is_empty() {
            &self.target_name
        } else {
            &self.custom_label
        }
    }
}

/// A loaded or collected session; samples are kept column-wise in memory
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub header: SessionHeader,
    /// Milliseconds per row
    pub durations: Vec<f64>,
    /// Calls per row; `None` when `header.entry_per_call`
    pub calls: Option<Vec<i32>>,
}

impl Session {
    /// Number of rows
    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    /// Calls of row `i` (1 for entry-per-call sessions)
    pub fn calls_at(&self, i: usize) -> i32 {
        match &self.calls {
            Some(calls) => calls.get(i).copied().unwrap_or(0),
            None => 1,
        }
    }

    /// Check the header against the sample arrays
    pub fn validate(&self) -> Result<()> {
        let header = &self.header;
        if header.entries < 0 || header.target_entries < 0 {
            return Err(SessionError::NegativeCount {
                entries: header.entries,
                target: header.target_entries,
            });
        }
        if header.entries > header.target_entries {
            return Err(SessionError::EntriesExceedTarget {
                entries: header.entries,
                target: header.target_entries,
            });
        }

        let expected = header.entries as usize;
        if self.durations.len() != expected {
            return Err(SessionError::InvalidLength {
                expected,
                found: self.durations.len(),
            });
        }
        match (&self.calls, header.entry_per_call) {
            (Some(calls), false) if calls.len() != expected => Err(SessionError::InvalidLength {
                expected,
                found: calls.len(),
            }),
            (Some(calls), true) => Err(SessionError::InvalidLength {
                expected: 0,
                found: calls.len(),
            }),
            (None, false) if expected > 0 => Err(SessionError::InvalidLength {
                expected,
                found: 0,
            }),
            _ => Ok(()),
        }
    }
}
