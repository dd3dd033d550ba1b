//! tilefeed-indexer — historic backfill from the checkpoint to the ledger head.

pub mod backfill;
pub mod builder;

pub use backfill::{Backfill, BackfillEvent, BackfillSummary};
pub use builder::BackfillBuilder;
