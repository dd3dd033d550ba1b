//! Fluent builder API for the backfill loop.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tilefeed_core::EventKindTable;
//! use tilefeed_indexer::BackfillBuilder;
//! use tilefeed_rpc::MockLedger;
//! use tilefeed_storage::MemoryStore;
//!
//! let backfill = BackfillBuilder::new()
//!     .genesis_block(640_000)
//!     .chunk_size(200)
//!     .retry_delay_ms(2_000)
//!     .build(
//!         Arc::new(MockLedger::new(640_010)),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(EventKindTable::default()),
//!     );
//! ```

use std::sync::Arc;

use tilefeed_core::{
    BatchMutator, CheckpointManager, CheckpointStore, EntityStore, EventKindTable, IndexerConfig,
};
use tilefeed_rpc::{BlockScanner, LedgerClient};

use crate::backfill::Backfill;

/// Fluent builder for [`IndexerConfig`] and [`Backfill`].
#[derive(Default)]
pub struct BackfillBuilder {
    config: IndexerConfig,
}

impl BackfillBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: IndexerConfig) -> Self {
        Self { config }
    }

    /// Set the checkpoint record key.
    pub fn checkpoint_key(mut self, key: impl Into<String>) -> Self {
        self.config.checkpoint_key = key.into();
        self
    }

    /// Set the block used when no checkpoint exists.
    pub fn genesis_block(mut self, block: u64) -> Self {
        self.config.genesis_block = block;
        self
    }

    /// Stop after this block even if the head is further.
    pub fn to_block(mut self, block: u64) -> Self {
        self.config.to_block = Some(block);
        self
    }

    /// Set the number of events requested per page.
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the fixed delay before a failed block is retried.
    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Wire a [`Backfill`] over `ledger`, with `store` holding both the
    /// entities and the checkpoint.
    pub fn build<S>(
        self,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<S>,
        table: Arc<EventKindTable>,
    ) -> Backfill
    where
        S: EntityStore + CheckpointStore + 'static,
    {
        let checkpoint = CheckpointManager::new(
            store.clone(),
            self.config.checkpoint_key.clone(),
            self.config.genesis_block,
        );
        let mutator = BatchMutator::new(store, table, checkpoint);
        let scanner = BlockScanner::new(ledger, self.config.chunk_size);
        Backfill::new(self.config, scanner, mutator)
    }
}
