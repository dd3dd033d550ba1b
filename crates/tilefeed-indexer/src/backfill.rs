//! The historic backfill loop.
//!
//! ```text
//! Idle → Scanning(b) → Applying(b) → Scanning(b+1) → … → CaughtUp
//! ```
//!
//! Starts at the checkpoint value and re-reads the ledger head on every
//! iteration, so blocks produced while backfilling are picked up too. A block
//! is re-processed from scratch after any fetch failure; the store writes are
//! idempotent, so at-least-once delivery converges.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use tilefeed_core::{ApplyReport, BatchMutator, FeedError, IndexerConfig, IndexerState};
use tilefeed_rpc::BlockScanner;

/// Status emitted by the backfill loop for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BackfillEvent {
    /// A block was fully applied.
    Progress { block: u64, head: u64, events: usize },
    /// A block will be retried after the configured delay.
    Retrying { block: u64, error: String },
    /// The loop passed the head (or `to_block`).
    Complete { at_block: u64 },
}

/// Totals of a finished backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub from_block: u64,
    /// Last block processed (equal to the checkpoint).
    pub to_block: Option<u64>,
    pub blocks: u64,
    pub events: u64,
    pub retries: u64,
}

/// Scans blocks one at a time and hands them to the [`BatchMutator`].
pub struct Backfill {
    config: IndexerConfig,
    scanner: BlockScanner,
    mutator: BatchMutator,
    state: IndexerState,
    events: Option<mpsc::UnboundedSender<BackfillEvent>>,
}

impl Backfill {
    pub fn new(config: IndexerConfig, scanner: BlockScanner, mutator: BatchMutator) -> Self {
        Self {
            config,
            scanner,
            mutator,
            state: IndexerState::Idle,
            events: None,
        }
    }

    /// Report progress on `tx`. Send errors (receiver gone) are ignored.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<BackfillEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    fn emit(&self, event: BackfillEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Run until the loop is past the ledger head (or `to_block`).
    ///
    /// Ledger and store failures never end the loop; they are logged and the
    /// same block is retried. Only a failure to read the checkpoint at start
    /// is returned.
    pub async fn run(&mut self) -> Result<BackfillSummary, FeedError> {
        let mut block = self.mutator.checkpoint().get().await?;
        let mut summary = BackfillSummary { from_block: block, ..Default::default() };

        tracing::info!(
            from = block,
            to_block = ?self.config.to_block,
            key = %self.mutator.checkpoint().key(),
            "starting backfill"
        );

        loop {
            let head = match self.scanner.head().await {
                Ok(h) => h,
                Err(e) => {
                    self.retry(block, &e, &mut summary).await;
                    continue;
                }
            };
            let target = self.config.to_block.map_or(head, |to| to.min(head));

            if block > target {
                self.state = IndexerState::CaughtUp;
                tracing::info!(
                    at = target,
                    blocks = summary.blocks,
                    events = summary.events,
                    "backfill complete"
                );
                self.emit(BackfillEvent::Complete { at_block: target });
                return Ok(summary);
            }

            match self.process(block).await {
                Ok(report) => {
                    if !report.is_clean() {
                        tracing::warn!(block, "block applied with batch failures");
                    }
                    summary.blocks += 1;
                    summary.events += report.events as u64;
                    summary.to_block = Some(block);
                    tracing::debug!(block, head, events = report.events, "block applied");
                    self.emit(BackfillEvent::Progress { block, head, events: report.events });
                    block += 1;
                }
                Err(e) => self.retry(block, &e, &mut summary).await,
            }
        }
    }

    /// Scan then apply one block.
    async fn process(&mut self, block: u64) -> Result<ApplyReport, FeedError> {
        self.state = IndexerState::Scanning { block };
        let events = self.scanner.scan(block).await?;

        self.state = IndexerState::Applying { block };
        self.mutator.apply(&events, block).await
    }

    async fn retry(&mut self, block: u64, error: &FeedError, summary: &mut BackfillSummary) {
        summary.retries += 1;
        tracing::warn!(
            block,
            error = %error,
            delay_ms = self.config.retry_delay_ms,
            "backfill step failed, retrying block"
        );
        self.emit(BackfillEvent::Retrying { block, error: error.to_string() });
        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
    }
}
