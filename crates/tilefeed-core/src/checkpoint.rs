//! Checkpoint manager — persists the last fully processed block.
//!
//! The checkpoint is a single keyed record. It is advanced only after every
//! batch of a block has been submitted, and it never moves backwards.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Key of the backfill cursor record.
pub const LAST_PROCESSED_BLOCK: &str = "lastProcessedBlock";

/// A persisted checkpoint record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Record key (normally [`LAST_PROCESSED_BLOCK`]).
    pub key: String,
    /// Last fully processed block number.
    pub block_number: u64,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Trait for storing and loading checkpoints.
///
/// Implemented by `MemoryCheckpointStore` here and by the storage backends.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Point read by key.
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, FeedError>;

    /// Atomic upsert by key (last writer wins).
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FeedError>;

    /// Delete a checkpoint (used when resetting an indexer).
    async fn delete(&self, key: &str) -> Result<(), FeedError>;
}

/// Reads and advances the backfill cursor.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    key: String,
    genesis_block: u64,
    /// Highest value this manager has read or written.
    last: Option<u64>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, key: impl Into<String>, genesis_block: u64) -> Self {
        Self {
            store,
            key: key.into(),
            genesis_block,
            last: None,
        }
    }

    /// Current block, or the genesis block if nothing was saved yet.
    pub async fn get(&mut self) -> Result<u64, FeedError> {
        let block = match self.store.load(&self.key).await? {
            Some(cp) => cp.block_number,
            None => self.genesis_block,
        };
        self.last = Some(self.last.map_or(block, |l| l.max(block)));
        Ok(block)
    }

    /// Advance the checkpoint to `block_number`.
    ///
    /// Returns `Ok(false)` without writing if that would move it backwards.
    pub async fn set(&mut self, block_number: u64) -> Result<bool, FeedError> {
        if let Some(last) = self.last {
            if block_number < last {
                tracing::warn!(
                    key = %self.key,
                    current = last,
                    requested = block_number,
                    "refusing to move checkpoint backwards"
                );
                return Ok(false);
            }
        }
        let cp = Checkpoint {
            key: self.key.clone(),
            block_number,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.save(cp).await?;
        self.last = Some(block_number);
        tracing::debug!(key = %self.key, block = block_number, "checkpoint advanced");
        Ok(true)
    }

    /// The checkpoint key this manager owns.
    pub fn key(&self) -> &str {
        &self.key
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory checkpoint store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Checkpoint>>, FeedError> {
        self.data
            .lock()
            .map_err(|_| FeedError::Storage("checkpoint map poisoned".into()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, FeedError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FeedError> {
        self.lock()?.insert(checkpoint.key.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), FeedError> {
        self.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(genesis: u64) -> (Arc<MemoryCheckpointStore>, CheckpointManager) {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mgr = CheckpointManager::new(store.clone(), LAST_PROCESSED_BLOCK, genesis);
        (store, mgr)
    }

    #[tokio::test]
    async fn genesis_when_absent() {
        let (_, mut mgr) = manager(640_000);
        assert_eq!(mgr.get().await.unwrap(), 640_000);
    }

    #[tokio::test]
    async fn set_then_get() {
        let (store, mut mgr) = manager(0);
        assert!(mgr.set(1000).await.unwrap());
        assert_eq!(mgr.get().await.unwrap(), 1000);

        let cp = store.load(LAST_PROCESSED_BLOCK).await.unwrap().unwrap();
        assert_eq!(cp.block_number, 1000);
    }

    #[tokio::test]
    async fn never_moves_backwards() {
        let (store, mut mgr) = manager(0);
        mgr.set(50).await.unwrap();
        assert!(!mgr.set(49).await.unwrap());
        assert!(mgr.set(50).await.unwrap(), "re-setting the same block is allowed");
        assert_eq!(store.load(LAST_PROCESSED_BLOCK).await.unwrap().unwrap().block_number, 50);
    }

    #[tokio::test]
    async fn resumes_from_stored_value() {
        let store = Arc::new(MemoryCheckpointStore::new());
        CheckpointManager::new(store.clone(), LAST_PROCESSED_BLOCK, 0)
            .set(77)
            .await
            .unwrap();

        let mut fresh = CheckpointManager::new(store, LAST_PROCESSED_BLOCK, 0);
        assert_eq!(fresh.get().await.unwrap(), 77);
        assert!(!fresh.set(10).await.unwrap());
    }
}
