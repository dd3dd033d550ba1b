//! Indexer configuration and state types.

use serde::{Deserialize, Serialize};

use crate::checkpoint::LAST_PROCESSED_BLOCK;

/// Configuration for the historic backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Checkpoint record key.
    pub checkpoint_key: String,
    /// Block to start from when no checkpoint exists.
    pub genesis_block: u64,
    /// Optional last block (bounded replays). `None` = up to the ledger head.
    pub to_block: Option<u64>,
    /// Events requested per RPC page.
    pub chunk_size: u32,
    /// Fixed delay before retrying a block after an RPC failure (milliseconds).
    pub retry_delay_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            checkpoint_key: LAST_PROCESSED_BLOCK.into(),
            genesis_block: 0,
            to_block: None,
            chunk_size: 100,
            retry_delay_ms: 5_000,
        }
    }
}

/// Runtime state of the backfill loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Fetching the events of a block.
    Scanning { block: u64 },
    /// Writing the batches of a block.
    Applying { block: u64 },
    /// Reached the ledger head; ingestion has handed off to live mode.
    CaughtUp,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning { block } => write!(f, "scanning({block})"),
            Self::Applying { block } => write!(f, "applying({block})"),
            Self::CaughtUp => write!(f, "caught-up"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = IndexerConfig::default();
        assert_eq!(cfg.checkpoint_key, "lastProcessedBlock");
        assert_eq!(cfg.chunk_size, 100);
        assert!(cfg.to_block.is_none());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg: IndexerConfig = serde_json::from_str(r#"{"genesis_block": 12}"#).unwrap();
        assert_eq!(cfg.genesis_block, 12);
        assert_eq!(cfg.retry_delay_ms, 5_000);
    }

    #[test]
    fn state_display() {
        assert_eq!(IndexerState::Scanning { block: 7 }.to_string(), "scanning(7)");
        assert_eq!(IndexerState::CaughtUp.to_string(), "caught-up");
    }
}
