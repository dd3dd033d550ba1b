//! Adaptive batch size and inter-batch wait.
//!
//! `depth` is what a subscriber has waiting: the shared buffer plus its own
//! backlog. The deeper it is, the larger each batch and the shorter the wait
//! before the next one:
//!
//! ```text
//! batch = clamp(min_batch + depth / 10, min_batch, max_batch)
//! wait  = max(base / (1 + depth / min_batch), min_interval)
//! ```

use std::time::Duration;

use crate::config::StreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    min_batch: usize,
    max_batch: usize,
    base: Duration,
    min_interval: Duration,
}

impl Pacing {
    pub fn new(min_batch: usize, max_batch: usize, base: Duration, min_interval: Duration) -> Self {
        let min_batch = min_batch.max(1);
        Self {
            min_batch,
            max_batch: max_batch.max(min_batch),
            base,
            min_interval: min_interval.min(base),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            config.min_batch,
            config.max_batch,
            Duration::from_millis(config.base_send_interval_ms),
            Duration::from_millis(config.min_send_interval_ms),
        )
    }

    /// Items to take in one batch at `depth`.
    pub fn batch_size(&self, depth: usize) -> usize {
        (self.min_batch + depth / 10).clamp(self.min_batch, self.max_batch)
    }

    /// Wait before the next batch at `depth`.
    pub fn wait(&self, depth: usize) -> Duration {
        let divisor = 1 + (depth / self.min_batch) as u32;
        (self.base / divisor).max(self.min_interval)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}
