//! tilefeed-core — the shared event model for ingestion and live fan-out.
//!
//! # Architecture
//!
//! ```text
//! RawEvent ──► EventKindTable::classify ──► (EventKind, MutationPlan)
//!                                                  │
//!                     BatchMutator::apply ◄────────┘
//!                        ├── agents batch   ─┐
//!                        ├── claims batch   ─┼─► EntityStore
//!                        ├── audit batch    ─┘
//!                        └── CheckpointManager::set (after all three)
//! ```

pub mod checkpoint;
pub mod error;
pub mod event;
pub mod indexer;
pub mod mutator;
pub mod store;
pub mod types;

pub use checkpoint::{CheckpointManager, CheckpointStore};
pub use error::FeedError;
pub use event::{Classification, EventKind, EventKindTable, MutationPlan};
pub use indexer::{IndexerConfig, IndexerState};
pub use mutator::{ApplyReport, BatchMutator};
pub use store::{AgentOp, ClaimOp, Collection, EntityStore, StatsSnapshot, StatsSource};
pub use types::{Agent, AgentStatus, AuditRecord, BroadcastItem, ClaimKind, LocationClaim, RawEvent};
