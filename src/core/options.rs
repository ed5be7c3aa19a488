//! Cache tuning knobs (normative defaults).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the change cache, channel caches, and feeds.
///
/// Values are intentionally explicit about their units to avoid confusion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Longest a gap may hold back newer pending sequences before the
    /// dispatcher force-advances past it.
    pub pending_seq_max_wait_ms: u64,
    /// Pending heap size that triggers an immediate force-advance.
    pub pending_seq_max_num: usize,
    /// Age at which a skipped sequence is abandoned for good.
    pub skipped_seq_max_wait_ms: u64,

    pub channel_cache_min_length: usize,
    pub channel_cache_max_length: usize,

    /// Capacity of the crossbeam channel backing a continuous feed.
    pub feed_buffer: usize,
    /// Long-poll bound for one-shot requests with `wait` set.
    pub wait_timeout_ms: u64,
}

impl CacheOptions {
    pub fn pending_seq_max_wait(&self) -> Duration {
        Duration::from_millis(self.pending_seq_max_wait_ms)
    }

    pub fn skipped_seq_max_wait(&self) -> Duration {
        Duration::from_millis(self.skipped_seq_max_wait_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            pending_seq_max_wait_ms: 5,
            pending_seq_max_num: 50,
            skipped_seq_max_wait_ms: 60 * 60 * 1000,

            channel_cache_min_length: 50,
            channel_cache_max_length: 500,

            feed_buffer: 50,
            wait_timeout_ms: 30_000,
        }
    }
}
