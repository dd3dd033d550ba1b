//! Entity store seam: the operations the batch mutator submits and the
//! read-only statistics query.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::types::{Agent, AgentStatus, AuditRecord, LocationClaim};

/// The three entity collections written per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Agents,
    Claims,
    Audit,
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agents => write!(f, "agents"),
            Self::Claims => write!(f, "claims"),
            Self::Audit => write!(f, "audit"),
        }
    }
}

// ─── Operations ───────────────────────────────────────────────────────────────

/// A write against the agents collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOp {
    /// Insert an alive agent with score 0, or refresh owner and origin of an
    /// existing one (score and status are left untouched).
    Spawn {
        address: String,
        owner: String,
        origin_location: String,
    },
    /// Set the status of an existing agent.
    SetStatus { address: String, status: AgentStatus },
}

impl AgentOp {
    pub fn address(&self) -> &str {
        match self {
            Self::Spawn { address, .. } | Self::SetStatus { address, .. } => address,
        }
    }
}

/// A write against the location-claims collection.
///
/// Score credits live with the claim write because they depend on the claim's
/// prior state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOp {
    /// Insert the claim only if `(agent, location)` is absent; credit `points`
    /// to the agent only when the insert happened.
    InsertIfAbsent { claim: LocationClaim, points: i64 },
    /// Overwrite the claim; credit `points` at most once per
    /// `(agent, location, kind)`, whatever the claim became since.
    Overwrite { claim: LocationClaim, points: i64 },
}

impl ClaimOp {
    pub fn claim(&self) -> &LocationClaim {
        match self {
            Self::InsertIfAbsent { claim, .. } | Self::Overwrite { claim, .. } => claim,
        }
    }

    pub fn points(&self) -> i64 {
        match self {
            Self::InsertIfAbsent { points, .. } | Self::Overwrite { points, .. } => *points,
        }
    }
}

/// Result of an unordered batch: individual failures do not stop the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub submitted: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn applied(&self) -> usize {
        self.submitted - self.failed
    }
}

/// Persistent store for derived entities and the audit trail.
///
/// Each method is one unordered batch. `Err` means the whole batch failed;
/// per-operation failures are counted in [`BatchOutcome::failed`].
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn apply_agents(&self, ops: Vec<AgentOp>) -> Result<BatchOutcome, FeedError>;

    async fn apply_claims(&self, ops: Vec<ClaimOp>) -> Result<BatchOutcome, FeedError>;

    async fn insert_audit(&self, records: Vec<AuditRecord>) -> Result<BatchOutcome, FeedError>;

    async fn agent(&self, address: &str) -> Result<Option<Agent>, FeedError>;

    async fn claim(
        &self,
        agent_address: &str,
        location: &str,
    ) -> Result<Option<LocationClaim>, FeedError>;

    async fn claim_count(&self) -> Result<u64, FeedError>;

    async fn audit_count(&self) -> Result<u64, FeedError>;
}

// ─── Stats ────────────────────────────────────────────────────────────────────

/// Summed score of all agents of one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerScore {
    pub owner: String,
    pub score: i64,
}

/// Claim counts per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCounts {
    pub empty: u64,
    pub hazard: u64,
    pub reward: u64,
}

/// Read-only aggregate pushed to stats subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_owners: u64,
    pub alive_agents: u64,
    pub dead_agents: u64,
    pub leaderboard: Vec<OwnerScore>,
    pub claims: ClaimCounts,
    pub generated_at: DateTime<Utc>,
}

/// Aggregation query used by the stats publisher.
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Snapshot with the `top_n` owners by summed score.
    async fn snapshot(&self, top_n: usize) -> Result<StatsSnapshot, FeedError>;
}
