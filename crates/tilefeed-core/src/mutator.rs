//! Batch mutator — turns one block's events into three independent store
//! batches and advances the checkpoint once all three have returned.
//!
//! The batches are not transactional with respect to each other: a failed
//! claims batch does not roll back the agents batch. Re-delivery of the same
//! block converges because claim inserts are insert-if-absent and
//! hazard/reward claims are force-overwrites to a terminal kind.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::checkpoint::CheckpointManager;
use crate::error::FeedError;
use crate::event::{EventKindTable, MutationPlan, EMPTY_CLAIM_POINTS, REWARD_POINTS};
use crate::store::{AgentOp, BatchOutcome, ClaimOp, Collection, EntityStore};
use crate::types::{AgentStatus, AuditRecord, ClaimKind, LocationClaim, RawEvent};

/// Operations derived from one block, grouped by collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationBatch {
    pub agents: Vec<AgentOp>,
    pub claims: Vec<ClaimOp>,
    pub audit: Vec<AuditRecord>,
    /// Mutating events whose payload was too short to act on.
    pub malformed: usize,
}

/// Group the mutations implied by `events` of `block`.
///
/// Every event yields exactly one audit record, mapped or not.
pub fn plan_batch(table: &EventKindTable, events: &[RawEvent], block: u64) -> MutationBatch {
    let mut batch = MutationBatch::default();

    for event in events {
        let class = table.classify(event);
        if class.is_malformed() {
            warn!(
                block,
                kind = %class.kind,
                fields = event.fields.len(),
                "malformed upstream payload, skipping mutation"
            );
            batch.malformed += 1;
        }

        let claim = |agent_address: &str, location: &str, kind| LocationClaim {
            agent_address: agent_address.to_string(),
            location: location.to_string(),
            kind,
            claimed_at: event.observed_at,
        };

        match &class.plan {
            MutationPlan::UpsertAgentSpawn { address, owner, origin_location } => {
                batch.agents.push(AgentOp::Spawn {
                    address: address.clone(),
                    owner: owner.clone(),
                    origin_location: origin_location.clone(),
                });
            }
            MutationPlan::ClaimEmptyIfAbsent { agent_address, location } => {
                batch.claims.push(ClaimOp::InsertIfAbsent {
                    claim: claim(agent_address, location, ClaimKind::Empty),
                    points: EMPTY_CLAIM_POINTS,
                });
            }
            MutationPlan::ClaimRewardForce { agent_address, location } => {
                batch.claims.push(ClaimOp::Overwrite {
                    claim: claim(agent_address, location, ClaimKind::Reward),
                    points: REWARD_POINTS,
                });
            }
            MutationPlan::ClaimHazardForce { agent_address, location } => {
                batch.claims.push(ClaimOp::Overwrite {
                    claim: claim(agent_address, location, ClaimKind::Hazard),
                    points: 0,
                });
                batch.agents.push(AgentOp::SetStatus {
                    address: agent_address.clone(),
                    status: AgentStatus::Dead,
                });
            }
            MutationPlan::NoMutation => {}
        }

        batch.audit.push(AuditRecord {
            block,
            event_name: class.kind.name().to_string(),
            event_hash: event.selector().unwrap_or_default().to_string(),
            fields: event.fields.clone(),
            timestamp: event.observed_at,
        });
    }

    batch
}

// ─── ApplyReport ──────────────────────────────────────────────────────────────

/// What happened to one collection's batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchStatus {
    /// Nothing to submit.
    Skipped,
    Applied(BatchOutcome),
    Failed { reason: String },
}

impl BatchStatus {
    fn from_result(collection: Collection, block: u64, result: Result<BatchOutcome, FeedError>) -> Self {
        match result {
            Ok(outcome) => {
                if outcome.failed > 0 {
                    warn!(
                        %collection,
                        block,
                        failed = outcome.failed,
                        submitted = outcome.submitted,
                        "partial batch failure"
                    );
                }
                Self::Applied(outcome)
            }
            Err(e) => {
                error!(%collection, block, error = %e, "batch write failed");
                Self::Failed { reason: e.to_string() }
            }
        }
    }

    /// Returns `true` if every submitted operation was applied.
    pub fn is_clean(&self) -> bool {
        match self {
            Self::Skipped => true,
            Self::Applied(o) => o.failed == 0,
            Self::Failed { .. } => false,
        }
    }
}

/// Summary of one [`BatchMutator::apply`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub block: u64,
    pub events: usize,
    pub malformed: usize,
    pub agents: BatchStatus,
    pub claims: BatchStatus,
    pub audit: BatchStatus,
    /// `false` if the checkpoint was already past this block.
    pub checkpoint_advanced: bool,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.agents.is_clean() && self.claims.is_clean() && self.audit.is_clean()
    }
}

// ─── BatchMutator ─────────────────────────────────────────────────────────────

/// Applies classified events to the entity store and owns the checkpoint.
pub struct BatchMutator {
    store: Arc<dyn EntityStore>,
    table: Arc<EventKindTable>,
    checkpoint: CheckpointManager,
}

impl BatchMutator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        table: Arc<EventKindTable>,
        checkpoint: CheckpointManager,
    ) -> Self {
        Self { store, table, checkpoint }
    }

    /// The checkpoint this mutator advances.
    pub fn checkpoint(&mut self) -> &mut CheckpointManager {
        &mut self.checkpoint
    }

    /// Submit the three batches for `block`, then advance the checkpoint.
    ///
    /// Batch failures are logged and reported, never propagated. Only a
    /// failed checkpoint write is returned as an error, in which case the
    /// caller retries the block.
    pub async fn apply(&mut self, events: &[RawEvent], block: u64) -> Result<ApplyReport, FeedError> {
        let batch = plan_batch(&self.table, events, block);
        debug!(
            block,
            agents = batch.agents.len(),
            claims = batch.claims.len(),
            audit = batch.audit.len(),
            "submitting block batches"
        );

        // Agents go first so claim credits find freshly spawned agents.
        let agents = if batch.agents.is_empty() {
            BatchStatus::Skipped
        } else {
            BatchStatus::from_result(Collection::Agents, block, self.store.apply_agents(batch.agents).await)
        };
        let claims = if batch.claims.is_empty() {
            BatchStatus::Skipped
        } else {
            BatchStatus::from_result(Collection::Claims, block, self.store.apply_claims(batch.claims).await)
        };
        let audit = if batch.audit.is_empty() {
            BatchStatus::Skipped
        } else {
            BatchStatus::from_result(Collection::Audit, block, self.store.insert_audit(batch.audit).await)
        };

        let checkpoint_advanced = self.checkpoint.set(block).await?;

        Ok(ApplyReport {
            block,
            events: events.len(),
            malformed: batch.malformed,
            agents,
            claims,
            audit,
            checkpoint_advanced,
        })
    }
}
