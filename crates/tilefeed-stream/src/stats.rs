//! Stats publisher — periodically snapshots the store and broadcasts the
//! serialized frame to every stats subscriber.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use tilefeed_core::{FeedError, StatsSource};

use crate::config::StatsConfig;
use crate::message::ServerMessage;

pub struct StatsPublisher {
    source: Arc<dyn StatsSource>,
    config: StatsConfig,
    tx: broadcast::Sender<String>,
}

impl StatsPublisher {
    pub fn new(source: Arc<dyn StatsSource>, config: StatsConfig) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { source, config, tx }
    }

    /// Receive every published `{"type":"stats",...}` frame.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// A fresh stats frame.
    pub async fn frame(&self) -> Result<String, FeedError> {
        let snapshot = self.source.snapshot(self.config.top_n).await?;
        ServerMessage::Stats(snapshot).to_json()
    }

    /// Publish one snapshot. Skips the query when nobody listens; returns the
    /// number of receivers reached.
    pub async fn publish_once(&self) -> Result<usize, FeedError> {
        if self.tx.receiver_count() == 0 {
            return Ok(0);
        }
        let frame = self.frame().await?;
        Ok(self.tx.send(frame).unwrap_or(0))
    }

    /// Publish every `interval_ms` until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.publish_once().await {
                Ok(0) => {}
                Ok(n) => debug!(receivers = n, "stats published"),
                Err(e) => warn!(error = %e, "stats snapshot failed"),
            }
        }
    }
}
