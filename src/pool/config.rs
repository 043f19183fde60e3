//! Pool configuration: the validated record, the backpressure policy, and
//! the JSON loader.
//!
//! The record can be built in code (`PoolConfig::new(queue_cap)` plus field
//! assignment) or loaded from JSON text, a parsed `serde_json::Value` tree,
//! or a file. Durations travel as `_ms` integer fields in JSON. Invalid
//! combinations are normalized rather than rejected (`max_threads` is
//! raised to `core_threads`, zero thresholds are inferred from capacity);
//! only malformed input and out-of-range ratios fail the loader.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a producer experiences when the queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueFullPolicy {
    /// Block the submitter until a slot frees up (or the queue closes).
    #[default]
    Block,
    /// Drop the new task; its handle resolves `Discarded`.
    Discard,
    /// Displace the oldest queued task; the displaced handle resolves
    /// `Overwritten`.
    Overwrite,
}

impl QueueFullPolicy {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Block => 0,
            Self::Discard => 1,
            Self::Overwrite => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Discard,
            2 => Self::Overwrite,
            _ => Self::Block,
        }
    }
}

impl fmt::Display for QueueFullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "Block"),
            Self::Discard => write!(f, "Discard"),
            Self::Overwrite => write!(f, "Overwrite"),
        }
    }
}

/// Validated pool configuration.
///
/// `queue_cap` is the one required field; everything else has the documented
/// default. The pool normalizes the record before use, so hand-built
/// configs never need manual sanity passes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Task queue capacity. Rounded up to a power of two >= 2.
    pub queue_cap: usize,

    /// Permanent worker count.
    #[serde(default = "defaults::core_threads")]
    pub core_threads: usize,

    /// Upper bound on dynamically spawned workers. Zero (or anything below
    /// `core_threads`) normalizes to `core_threads`.
    #[serde(default)]
    pub max_threads: usize,

    /// Idle window before a surplus worker retires.
    #[serde(rename = "keep_alive_ms", with = "duration_ms")]
    #[serde(default = "defaults::keep_alive")]
    pub keep_alive: Duration,

    /// Load monitor sampling interval.
    #[serde(rename = "load_check_interval_ms", with = "duration_ms")]
    #[serde(default = "defaults::load_check_interval")]
    pub load_check_interval: Duration,

    /// Busy-ratio threshold above which the pool considers growing.
    #[serde(default = "defaults::scale_up_threshold")]
    pub scale_up_threshold: f64,

    /// Busy-ratio threshold below which the pool considers shrinking.
    #[serde(default = "defaults::scale_down_threshold")]
    pub scale_down_threshold: f64,

    /// Queue-length trigger for scale-up. Zero infers `max(1, cap / 2)`.
    #[serde(default)]
    pub pending_hi: usize,

    /// Queue-length trigger for scale-down. Zero infers `max(1, cap / 8)`.
    #[serde(default)]
    pub pending_low: usize,

    /// Consecutive monitor ticks a condition must hold before acting.
    #[serde(default = "defaults::debounce_hits")]
    pub debounce_hits: usize,

    /// Minimum interval between scale events.
    #[serde(rename = "cooldown_ms", with = "duration_ms")]
    #[serde(default = "defaults::cooldown")]
    pub cooldown: Duration,

    /// Behavior when the queue is full.
    #[serde(default)]
    pub queue_policy: QueueFullPolicy,
}

mod defaults {
    use std::time::Duration;

    pub fn core_threads() -> usize {
        1
    }
    pub fn keep_alive() -> Duration {
        Duration::from_secs(60)
    }
    pub fn load_check_interval() -> Duration {
        Duration::from_millis(20)
    }
    pub fn scale_up_threshold() -> f64 {
        0.8
    }
    pub fn scale_down_threshold() -> f64 {
        0.2
    }
    pub fn debounce_hits() -> usize {
        3
    }
    pub fn cooldown() -> Duration {
        Duration::from_millis(500)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Configuration loading failures.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Io(std::io::Error),
    /// The input was not valid JSON, or a field had the wrong shape.
    Parse(serde_json::Error),
    /// A ratio field fell outside `[0.0, 1.0]`.
    InvalidThreshold { field: &'static str, value: f64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "cannot read config: {err}"),
            Self::Parse(err) => write!(f, "cannot parse config: {err}"),
            Self::InvalidThreshold { field, value } => {
                write!(f, "{field} must be within [0.0, 1.0], got {value}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::InvalidThreshold { .. } => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err)
    }
}

impl PoolConfig {
    /// A config with the given queue capacity and documented defaults.
    pub fn new(queue_cap: usize) -> Self {
        Self {
            queue_cap,
            core_threads: defaults::core_threads(),
            max_threads: 0,
            keep_alive: defaults::keep_alive(),
            load_check_interval: defaults::load_check_interval(),
            scale_up_threshold: defaults::scale_up_threshold(),
            scale_down_threshold: defaults::scale_down_threshold(),
            pending_hi: 0,
            pending_low: 0,
            debounce_hits: defaults::debounce_hits(),
            cooldown: defaults::cooldown(),
            queue_policy: QueueFullPolicy::default(),
        }
    }

    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Converts an already-parsed JSON tree.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_value(value)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Serializes the record back to pretty JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("config serialization cannot fail")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("scale_up_threshold", self.scale_up_threshold),
            ("scale_down_threshold", self.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ConfigError::InvalidThreshold { field, value });
            }
        }
        Ok(())
    }

    /// Applies the normalization rules the pool relies on.
    ///
    /// - capacity rounds up to a power of two >= 2
    /// - `core_threads >= 1`, `max_threads >= core_threads`
    /// - zero pending thresholds are inferred from capacity
    /// - `pending_low <= pending_hi`, `debounce_hits >= 1`
    pub(crate) fn normalized(mut self) -> Self {
        self.queue_cap = self.queue_cap.max(2).next_power_of_two();
        self.core_threads = self.core_threads.max(1);
        self.max_threads = self.max_threads.max(self.core_threads);
        if self.pending_hi == 0 {
            self.pending_hi = (self.queue_cap / 2).max(1);
        }
        if self.pending_low == 0 {
            self.pending_low = (self.queue_cap / 8).max(1);
        }
        self.pending_low = self.pending_low.min(self.pending_hi);
        self.debounce_hits = self.debounce_hits.max(1);
        self
    }
}
