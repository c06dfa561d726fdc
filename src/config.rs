//! Tunable coordination thresholds.
//!
//! The quorum timeout and the two batching windows were tuned empirically
//! in the systems this crate grew out of; they are configuration, not
//! contracts. The embedding application loads and passes a `Config`; this
//! crate only defines the type and its defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default quorum timeout (milliseconds).
pub const DEFAULT_QUORUM_TIMEOUT_MS: u64 = 30_000;

/// Default fast wait window for explicitly targeted traffic (milliseconds).
pub const DEFAULT_FAST_WINDOW_MS: u64 = 500;

/// Default accumulation window for unaddressed traffic (milliseconds).
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 5_000;

/// Default cap on a meeting's retained message history.
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// Coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// How long a meeting owner waits for all required attendees to join.
    #[serde(default = "default_quorum_timeout")]
    pub quorum_timeout_ms: u64,

    /// Wait window when buffered traffic explicitly targets the waiter.
    #[serde(default = "default_fast_window")]
    pub fast_window_ms: u64,

    /// Wait window when nothing buffered targets the waiter, so several
    /// contributions can accumulate before interrupting it.
    #[serde(default = "default_batch_window")]
    pub batch_window_ms: u64,

    /// Maximum messages retained in a meeting's history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_quorum_timeout() -> u64 {
    DEFAULT_QUORUM_TIMEOUT_MS
}

fn default_fast_window() -> u64 {
    DEFAULT_FAST_WINDOW_MS
}

fn default_batch_window() -> u64 {
    DEFAULT_BATCH_WINDOW_MS
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quorum_timeout_ms: DEFAULT_QUORUM_TIMEOUT_MS,
            fast_window_ms: DEFAULT_FAST_WINDOW_MS,
            batch_window_ms: DEFAULT_BATCH_WINDOW_MS,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl Config {
    /// Quorum timeout as a `Duration`.
    pub fn quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.quorum_timeout_ms)
    }

    /// Fast window as a `Duration`.
    pub fn fast_window(&self) -> Duration {
        Duration::from_millis(self.fast_window_ms)
    }

    /// Batch window as a `Duration`.
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}
