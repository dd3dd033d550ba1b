//! In-memory storage backend.
//!
//! Holds agents, claims, the audit trail and checkpoints in RAM. Used by the
//! tests and by the `memory` store backend for throwaway sessions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use tilefeed_core::checkpoint::{Checkpoint, CheckpointStore};
use tilefeed_core::store::{BatchOutcome, ClaimCounts, OwnerScore};
use tilefeed_core::{
    Agent, AgentOp, AgentStatus, AuditRecord, ClaimKind, ClaimOp, Collection, EntityStore,
    FeedError, LocationClaim, StatsSnapshot, StatsSource,
};

#[derive(Default)]
struct State {
    agents: HashMap<String, Agent>,
    claims: HashMap<(String, String), LocationClaim>,
    /// Overwrite credits already paid, per `(agent, location, kind)`.
    credited: HashSet<(String, String, ClaimKind)>,
    audit: Vec<AuditRecord>,
    checkpoints: HashMap<String, Checkpoint>,
}

impl State {
    fn apply_agent(&mut self, op: AgentOp) -> Result<(), String> {
        match op {
            AgentOp::Spawn { address, owner, origin_location } => {
                self.agents
                    .entry(address.clone())
                    .and_modify(|a| {
                        a.owner = owner.clone();
                        a.origin_location = origin_location.clone();
                    })
                    .or_insert(Agent {
                        address,
                        owner,
                        status: AgentStatus::Alive,
                        score: 0,
                        origin_location,
                    });
                Ok(())
            }
            AgentOp::SetStatus { address, status } => match self.agents.get_mut(&address) {
                Some(agent) => {
                    agent.status = status;
                    Ok(())
                }
                None => Err(format!("unknown agent {address}")),
            },
        }
    }

    fn apply_claim(&mut self, op: ClaimOp) {
        let points = op.points();
        let credit = match op {
            ClaimOp::InsertIfAbsent { claim, .. } => {
                let key = claim.key();
                if self.claims.contains_key(&key) {
                    None
                } else {
                    let agent = claim.agent_address.clone();
                    self.claims.insert(key, claim);
                    Some(agent)
                }
            }
            ClaimOp::Overwrite { claim, .. } => {
                let (agent, location) = claim.key();
                let first = points != 0
                    && self.credited.insert((agent.clone(), location, claim.kind));
                self.claims.insert(claim.key(), claim);
                first.then_some(agent)
            }
        };

        if let Some(address) = credit.filter(|_| points != 0) {
            match self.agents.get_mut(&address) {
                Some(agent) => agent.score += points,
                None => debug!(agent = %address, points, "claim credit for unknown agent dropped"),
            }
        }
    }
}

/// In-memory entity and checkpoint store.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    /// Collections whose next batches fail as a whole.
    failing: Mutex<HashSet<Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, FeedError> {
        self.state
            .lock()
            .map_err(|_| FeedError::Storage("memory store poisoned".into()))
    }

    /// Make every batch against `collection` fail until [`Self::heal`].
    pub fn fail_collection(&self, collection: Collection) {
        if let Ok(mut f) = self.failing.lock() {
            f.insert(collection);
        }
    }

    pub fn heal(&self, collection: Collection) {
        if let Ok(mut f) = self.failing.lock() {
            f.remove(&collection);
        }
    }

    fn check(&self, collection: Collection) -> Result<(), FeedError> {
        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(&collection))
            .unwrap_or(false);
        if failing {
            return Err(FeedError::store_write(collection, "injected failure"));
        }
        Ok(())
    }

    /// All agents, ordered by address.
    pub fn agents(&self) -> Result<Vec<Agent>, FeedError> {
        let state = self.state()?;
        let sorted: BTreeMap<_, _> = state.agents.iter().collect();
        Ok(sorted.into_values().cloned().collect())
    }

    /// All claims, ordered by `(agent, location)`.
    pub fn claims(&self) -> Result<Vec<LocationClaim>, FeedError> {
        let state = self.state()?;
        let sorted: BTreeMap<_, _> = state.claims.iter().collect();
        Ok(sorted.into_values().cloned().collect())
    }

    /// The audit trail in insertion order.
    pub fn audit(&self) -> Result<Vec<AuditRecord>, FeedError> {
        Ok(self.state()?.audit.clone())
    }
}

// ─── CheckpointStore ──────────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, FeedError> {
        Ok(self.state()?.checkpoints.get(key).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FeedError> {
        self.state()?
            .checkpoints
            .insert(checkpoint.key.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), FeedError> {
        self.state()?.checkpoints.remove(key);
        Ok(())
    }
}

// ─── EntityStore ──────────────────────────────────────────────────────────────

#[async_trait]
impl EntityStore for MemoryStore {
    async fn apply_agents(&self, ops: Vec<AgentOp>) -> Result<BatchOutcome, FeedError> {
        self.check(Collection::Agents)?;
        let mut state = self.state()?;
        let mut outcome = BatchOutcome { submitted: ops.len(), failed: 0 };
        for op in ops {
            if let Err(reason) = state.apply_agent(op) {
                debug!(%reason, "agent op failed");
                outcome.failed += 1;
            }
        }
        Ok(outcome)
    }

    async fn apply_claims(&self, ops: Vec<ClaimOp>) -> Result<BatchOutcome, FeedError> {
        self.check(Collection::Claims)?;
        let mut state = self.state()?;
        let outcome = BatchOutcome { submitted: ops.len(), failed: 0 };
        for op in ops {
            state.apply_claim(op);
        }
        Ok(outcome)
    }

    async fn insert_audit(&self, records: Vec<AuditRecord>) -> Result<BatchOutcome, FeedError> {
        self.check(Collection::Audit)?;
        let submitted = records.len();
        self.state()?.audit.extend(records);
        Ok(BatchOutcome { submitted, failed: 0 })
    }

    async fn agent(&self, address: &str) -> Result<Option<Agent>, FeedError> {
        Ok(self.state()?.agents.get(address).cloned())
    }

    async fn claim(
        &self,
        agent_address: &str,
        location: &str,
    ) -> Result<Option<LocationClaim>, FeedError> {
        let key = (agent_address.to_string(), location.to_string());
        Ok(self.state()?.claims.get(&key).cloned())
    }

    async fn claim_count(&self) -> Result<u64, FeedError> {
        Ok(self.state()?.claims.len() as u64)
    }

    async fn audit_count(&self) -> Result<u64, FeedError> {
        Ok(self.state()?.audit.len() as u64)
    }
}

// ─── StatsSource ──────────────────────────────────────────────────────────────

#[async_trait]
impl StatsSource for MemoryStore {
    async fn snapshot(&self, top_n: usize) -> Result<StatsSnapshot, FeedError> {
        let state = self.state()?;

        let mut by_owner: HashMap<&str, i64> = HashMap::new();
        let (mut alive, mut dead) = (0u64, 0u64);
        for agent in state.agents.values() {
            *by_owner.entry(agent.owner.as_str()).or_default() += agent.score;
            match agent.status {
                AgentStatus::Alive => alive += 1,
                AgentStatus::Dead => dead += 1,
            }
        }

        let mut leaderboard: Vec<OwnerScore> = by_owner
            .iter()
            .map(|(owner, score)| OwnerScore { owner: owner.to_string(), score: *score })
            .collect();
        leaderboard.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.owner.cmp(&b.owner)));
        leaderboard.truncate(top_n);

        let mut claims = ClaimCounts::default();
        for claim in state.claims.values() {
            match claim.kind {
                ClaimKind::Empty => claims.empty += 1,
                ClaimKind::Hazard => claims.hazard += 1,
                ClaimKind::Reward => claims.reward += 1,
            }
        }

        Ok(StatsSnapshot {
            total_owners: by_owner.len() as u64,
            alive_agents: alive,
            dead_agents: dead,
            leaderboard,
            claims,
            generated_at: chrono::Utc::now(),
        })
    }
}
