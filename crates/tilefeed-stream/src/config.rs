//! Live fan-out and stats configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning of the poller, the shared buffer and per-subscriber pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Maximum items held in the shared buffer.
    pub buffer_capacity: usize,
    /// Depth under which a drain triggers an immediate refetch.
    pub low_water_mark: usize,
    /// Base interval between pending-window polls (milliseconds).
    pub poll_interval_ms: u64,
    /// Events requested per pending-window page.
    pub chunk_size: u32,
    /// Maximum items held in each subscriber's backlog.
    pub backlog_cap: usize,
    /// Smallest batch sent to a subscriber.
    pub min_batch: usize,
    /// Largest batch sent to a subscriber.
    pub max_batch: usize,
    /// Wait between batches when the shared buffer is empty (milliseconds).
    pub base_send_interval_ms: u64,
    /// Floor on the wait between batches (milliseconds).
    pub min_send_interval_ms: u64,
    /// Pending-event identities remembered for de-duplication.
    pub seen_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1_000,
            low_water_mark: 100,
            poll_interval_ms: 2_000,
            chunk_size: 100,
            backlog_cap: 500,
            min_batch: 5,
            max_batch: 50,
            base_send_interval_ms: 1_000,
            min_send_interval_ms: 50,
            seen_capacity: 10_000,
        }
    }
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Stats publisher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Interval between snapshots (milliseconds).
    pub interval_ms: u64,
    /// Owners on the leaderboard.
    pub top_n: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { interval_ms: 5_000, top_n: 10 }
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
