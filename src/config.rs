//! Engine configuration
//!
//! Every tunable of the engine lives in [`EngineConfig`]. It can be built in
//! code (`Default`, presets) or loaded from a TOML file:
//!
//! ```toml
//! buffer_capacity = 2000
//! cooldown_secs = 30
//! sort_key = "percent"
//! session_dir = "sessions"
//!
//! [cadence]
//! interval_ms = 500
//! ```

use crate::aggregator::SortKey;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest collection size a session may request
pub const MIN_TARGET_ENTRIES: i32 = 50;

/// Largest collection size a session may request
pub const MAX_TARGET_ENTRIES: i32 = 50_000;

/// How often the statistics aggregator rebuilds the ranked view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Every N measurement cycles
    Cycles(u32),
    /// Every N milliseconds of wall time
    IntervalMs(u64),
}

impl Cadence {
    /// Wall-clock period, if this cadence is time based
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Cadence::IntervalMs(ms) => Some(Duration::from_millis(*ms)),
            Cadence::Cycles(_) => None,
        }
    }
}

/// Configuration for the instrumentation engine
///
/// # Example
/// ```
/// use probeweave::config::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.buffer_capacity, 2000);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of cycles each probe keeps in its circular buffer
    pub buffer_capacity: usize,

    /// Growth quantum of the registry's slot arrays
    pub array_expand_size: usize,

    /// Aggregation cadence
    pub cadence: Cadence,

    /// Quiescent period before all instrumentation is torn down
    pub cooldown_secs: u64,

    /// Key used to rank published logs
    pub sort_key: SortKey,

    /// Directory holding session files
    pub session_dir: PathBuf,

    /// Default number of samples a new collection aims for
    pub default_target_entries: i32,

    /// Report duplicate registrations at warn level instead of debug
    pub verbose_logging: bool,

    /// Ask the host to pause when an error is surfaced (diagnostic mode)
    pub pause_on_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 2000,
            array_expand_size: 128,
            cadence: Cadence::IntervalMs(500),
            cooldown_secs: 30,
            sort_key: SortKey::Percent,
            session_dir: PathBuf::from("sessions"),
            default_target_entries: 2000,
            verbose_logging: false,
            pause_on_error: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    ///
    /// Missing fields fall back to their defaults. The result is validated.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).context("Failed to parse engine configuration")?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid engine configuration: {}", e))?;
        Ok(config)
    }

    /// Configuration suited to unit tests and short replays: small buffers,
    /// cycle-driven aggregation, no cooldown delay worth waiting for.
    pub fn compact() -> Self {
        Self {
            buffer_capacity: 64,
            array_expand_size: 16,
            cadence: Cadence::Cycles(1),
            cooldown_secs: 1,
            default_target_entries: MIN_TARGET_ENTRIES,
            ..Self::default()
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_capacity < 2 {
            return Err(format!(
                "buffer_capacity must be >= 2, got {}",
                self.buffer_capacity
            ));
        }

        if self.array_expand_size == 0 {
            return Err("array_expand_size must be > 0".to_string());
        }

        match self.cadence {
            Cadence::Cycles(0) => return Err("cadence cycles must be > 0".to_string()),
            Cadence::IntervalMs(0) => return Err("cadence interval_ms must be > 0".to_string()),
            _ => {}
        }

        if !(MIN_TARGET_ENTRIES..=MAX_TARGET_ENTRIES).contains(&self.default_target_entries) {
            return Err(format!(
                "default_target_entries must be in [{}, {}], got {}",
                MIN_TARGET_ENTRIES, MAX_TARGET_ENTRIES, self.default_target_entries
            ));
        }

        Ok(())
    }
}
