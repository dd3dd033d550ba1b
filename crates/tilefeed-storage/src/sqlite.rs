//! SQLite storage backend.
//!
//! Persists agents, location claims, the audit log and checkpoints to a
//! single SQLite file via `sqlx`, in WAL mode.
//!
//! # Usage
//! ```rust,no_run
//! use tilefeed_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./tilefeed.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use tilefeed_core::checkpoint::{Checkpoint, CheckpointStore};
use tilefeed_core::store::{BatchOutcome, ClaimCounts, OwnerScore};
use tilefeed_core::{
    Agent, AgentOp, AgentStatus, AuditRecord, ClaimKind, ClaimOp, EntityStore, FeedError,
    LocationClaim, StatsSnapshot, StatsSource,
};

fn storage(e: sqlx::Error) -> FeedError {
    FeedError::Storage(e.to_string())
}

/// SQLite-backed entity and checkpoint store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./tilefeed.db"`) or a full
    /// SQLite URL (`"sqlite:./tilefeed.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, FeedError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `sqlite::memory:` is a separate database, so the
    /// pool is limited to one connection.
    pub async fn in_memory() -> Result<Self, FeedError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), FeedError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        let statements = [
            "CREATE TABLE IF NOT EXISTS checkpoints (
                key          TEXT    PRIMARY KEY,
                block_number INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS agents (
                address         TEXT    PRIMARY KEY,
                owner           TEXT    NOT NULL,
                status          TEXT    NOT NULL,
                score           INTEGER NOT NULL DEFAULT 0,
                origin_location TEXT    NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS location_claims (
                agent_address TEXT NOT NULL,
                location      TEXT NOT NULL,
                kind          TEXT NOT NULL,
                claimed_at    TEXT NOT NULL,
                PRIMARY KEY (agent_address, location)
            );",
            "CREATE TABLE IF NOT EXISTS claim_credits (
                agent_address TEXT NOT NULL,
                location      TEXT NOT NULL,
                kind          TEXT NOT NULL,
                PRIMARY KEY (agent_address, location, kind)
            );",
            "CREATE TABLE IF NOT EXISTS audit_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                block       INTEGER NOT NULL,
                event_name  TEXT    NOT NULL,
                event_hash  TEXT    NOT NULL,
                fields_json TEXT    NOT NULL,
                timestamp   TEXT    NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_agents_owner ON agents (owner);",
            "CREATE INDEX IF NOT EXISTS idx_audit_block ON audit_log (block);",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(storage)?;
        }
        Ok(())
    }

    // ─── Per-operation writes ───────────────────────────────────────────────────

    async fn apply_agent(&self, op: &AgentOp) -> Result<(), FeedError> {
        match op {
            AgentOp::Spawn { address, owner, origin_location } => {
                sqlx::query(
                    "INSERT INTO agents (address, owner, status, score, origin_location)
                     VALUES (?, ?, ?, 0, ?)
                     ON CONFLICT(address) DO UPDATE SET
                        owner = excluded.owner,
                        origin_location = excluded.origin_location",
                )
                .bind(address)
                .bind(owner)
                .bind(AgentStatus::Alive.as_str())
                .bind(origin_location)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
            }
            AgentOp::SetStatus { address, status } => {
                let done = sqlx::query("UPDATE agents SET status = ? WHERE address = ?")
                    .bind(status.as_str())
                    .bind(address)
                    .execute(&self.pool)
                    .await
                    .map_err(storage)?;
                if done.rows_affected() == 0 {
                    return Err(FeedError::Storage(format!("unknown agent {address}")));
                }
            }
        }
        Ok(())
    }

    /// One claim write plus its score credit, in a single transaction.
    async fn apply_claim(&self, op: &ClaimOp) -> Result<(), FeedError> {
        let claim = op.claim();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let credit = match op {
            ClaimOp::InsertIfAbsent { .. } => {
                let done = sqlx::query(
                    "INSERT OR IGNORE INTO location_claims (agent_address, location, kind, claimed_at)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&claim.agent_address)
                .bind(&claim.location)
                .bind(claim.kind.as_str())
                .bind(claim.claimed_at)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
                done.rows_affected() == 1
            }
            ClaimOp::Overwrite { points, .. } => {
                sqlx::query(
                    "INSERT INTO location_claims (agent_address, location, kind, claimed_at)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(agent_address, location) DO UPDATE SET
                        kind = excluded.kind,
                        claimed_at = excluded.claimed_at",
                )
                .bind(&claim.agent_address)
                .bind(&claim.location)
                .bind(claim.kind.as_str())
                .bind(claim.claimed_at)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;

                // Paid at most once per (agent, location, kind).
                if *points == 0 {
                    false
                } else {
                    let done = sqlx::query(
                        "INSERT OR IGNORE INTO claim_credits (agent_address, location, kind)
                         VALUES (?, ?, ?)",
                    )
                    .bind(&claim.agent_address)
                    .bind(&claim.location)
                    .bind(claim.kind.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(storage)?;
                    done.rows_affected() == 1
                }
            }
        };

        if credit && op.points() != 0 {
            sqlx::query("UPDATE agents SET score = score + ? WHERE address = ?")
                .bind(op.points())
                .bind(&claim.agent_address)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)
    }

    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), FeedError> {
        let fields = serde_json::to_string(&record.fields)
            .map_err(|e| FeedError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO audit_log (block, event_name, event_hash, fields_json, timestamp)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.block as i64)
        .bind(&record.event_name)
        .bind(&record.event_hash)
        .bind(&fields)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn count(&self, sql: &str) -> Result<u64, FeedError> {
        let row = sqlx::query(sql).fetch_one(&self.pool).await.map_err(storage)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

fn row_to_agent(r: &sqlx::sqlite::SqliteRow) -> Agent {
    let status: String = r.get("status");
    Agent {
        address: r.get("address"),
        owner: r.get("owner"),
        status: AgentStatus::parse(&status).unwrap_or(AgentStatus::Alive),
        score: r.get("score"),
        origin_location: r.get("origin_location"),
    }
}

// ─── CheckpointStore impl ─────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, FeedError> {
        let row = sqlx::query("SELECT key, block_number, updated_at FROM checkpoints WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        Ok(row.map(|r| Checkpoint {
            key: r.get("key"),
            block_number: r.get::<i64, _>("block_number") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FeedError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints (key, block_number, updated_at)
             VALUES (?, ?, ?)",
        )
        .bind(&checkpoint.key)
        .bind(checkpoint.block_number as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        debug!(key = %checkpoint.key, block = checkpoint.block_number, "checkpoint saved");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), FeedError> {
        sqlx::query("DELETE FROM checkpoints WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

// ─── EntityStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl EntityStore for SqliteStore {
    async fn apply_agents(&self, ops: Vec<AgentOp>) -> Result<BatchOutcome, FeedError> {
        let mut outcome = BatchOutcome { submitted: ops.len(), failed: 0 };
        for op in &ops {
            if let Err(e) = self.apply_agent(op).await {
                warn!(agent = op.address(), error = %e, "agent write failed");
                outcome.failed += 1;
            }
        }
        Ok(outcome)
    }

    async fn apply_claims(&self, ops: Vec<ClaimOp>) -> Result<BatchOutcome, FeedError> {
        let mut outcome = BatchOutcome { submitted: ops.len(), failed: 0 };
        for op in &ops {
            if let Err(e) = self.apply_claim(op).await {
                let claim = op.claim();
                warn!(
                    agent = %claim.agent_address,
                    location = %claim.location,
                    error = %e,
                    "claim write failed"
                );
                outcome.failed += 1;
            }
        }
        Ok(outcome)
    }

    async fn insert_audit(&self, records: Vec<AuditRecord>) -> Result<BatchOutcome, FeedError> {
        let mut outcome = BatchOutcome { submitted: records.len(), failed: 0 };
        for record in &records {
            if let Err(e) = self.insert_audit_record(record).await {
                warn!(block = record.block, event = %record.event_name, error = %e, "audit write failed");
                outcome.failed += 1;
            }
        }
        Ok(outcome)
    }

    async fn agent(&self, address: &str) -> Result<Option<Agent>, FeedError> {
        let row = sqlx::query(
            "SELECT address, owner, status, score, origin_location FROM agents WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.as_ref().map(row_to_agent))
    }

    async fn claim(
        &self,
        agent_address: &str,
        location: &str,
    ) -> Result<Option<LocationClaim>, FeedError> {
        let row = sqlx::query(
            "SELECT agent_address, location, kind, claimed_at FROM location_claims
             WHERE agent_address = ? AND location = ?",
        )
        .bind(agent_address)
        .bind(location)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(|r| {
            let kind: String = r.get("kind");
            let kind = ClaimKind::parse(&kind)
                .ok_or_else(|| FeedError::Storage(format!("unknown claim kind '{kind}'")))?;
            Ok(LocationClaim {
                agent_address: r.get("agent_address"),
                location: r.get("location"),
                kind,
                claimed_at: r.get::<DateTime<Utc>, _>("claimed_at"),
            })
        })
        .transpose()
    }

    async fn claim_count(&self) -> Result<u64, FeedError> {
        self.count("SELECT COUNT(*) AS cnt FROM location_claims").await
    }

    async fn audit_count(&self) -> Result<u64, FeedError> {
        self.count("SELECT COUNT(*) AS cnt FROM audit_log").await
    }
}

// ─── StatsSource impl ─────────────────────────────────────────────────────────

#[async_trait]
impl StatsSource for SqliteStore {
    async fn snapshot(&self, top_n: usize) -> Result<StatsSnapshot, FeedError> {
        let total_owners = self.count("SELECT COUNT(DISTINCT owner) AS cnt FROM agents").await?;

        let (mut alive_agents, mut dead_agents) = (0u64, 0u64);
        let rows = sqlx::query("SELECT status, COUNT(*) AS cnt FROM agents GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        for r in rows {
            let status: String = r.get("status");
            let cnt = r.get::<i64, _>("cnt") as u64;
            match AgentStatus::parse(&status) {
                Some(AgentStatus::Alive) => alive_agents += cnt,
                Some(AgentStatus::Dead) => dead_agents += cnt,
                None => {}
            }
        }

        let leaderboard = sqlx::query(
            "SELECT owner, SUM(score) AS score FROM agents
             GROUP BY owner ORDER BY score DESC, owner ASC LIMIT ?",
        )
        .bind(top_n as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?
        .into_iter()
        .map(|r| OwnerScore { owner: r.get("owner"), score: r.get("score") })
        .collect();

        let mut claims = ClaimCounts::default();
        let rows = sqlx::query("SELECT kind, COUNT(*) AS cnt FROM location_claims GROUP BY kind")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        for r in rows {
            let kind: String = r.get("kind");
            let cnt = r.get::<i64, _>("cnt") as u64;
            match ClaimKind::parse(&kind) {
                Some(ClaimKind::Empty) => claims.empty += cnt,
                Some(ClaimKind::Hazard) => claims.hazard += cnt,
                Some(ClaimKind::Reward) => claims.reward += cnt,
                None => {}
            }
        }

        Ok(StatsSnapshot {
            total_owners,
            alive_agents,
            dead_agents,
            leaderboard,
            claims,
            generated_at: Utc::now(),
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(address: &str, owner: &str) -> AgentOp {
        AgentOp::Spawn {
            address: address.into(),
            owner: owner.into(),
            origin_location: "0x10".into(),
        }
    }

    fn claim(agent: &str, location: &str, kind: ClaimKind) -> LocationClaim {
        LocationClaim {
            agent_address: agent.into(),
            location: location.into(),
            kind,
            claimed_at: Utc::now(),
        }
    }

    // ── CheckpointStore ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_upsert_and_delete() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.load("lastProcessedBlock").await.unwrap().is_none());

        for block in [100, 200] {
            store
                .save(Checkpoint { key: "lastProcessedBlock".into(), block_number: block, updated_at: 1 })
                .await
                .unwrap();
        }
        let cp = store.load("lastProcessedBlock").await.unwrap().unwrap();
        assert_eq!(cp.block_number, 200);

        store.delete("lastProcessedBlock").await.unwrap();
        assert!(store.load("lastProcessedBlock").await.unwrap().is_none());
    }

    // ── Entities ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn spawn_upsert_keeps_score_and_status() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.apply_agents(vec![spawn("0xa", "0xo")]).await.unwrap();
        store
            .apply_agents(vec![AgentOp::SetStatus { address: "0xa".into(), status: AgentStatus::Dead }])
            .await
            .unwrap();
        store.apply_agents(vec![spawn("0xa", "0xo")]).await.unwrap();

        let agent = store.agent("0xa").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Dead);
        assert_eq!(agent.score, 0);
        assert_eq!(agent.origin_location, "0x10");
    }

    #[tokio::test]
    async fn empty_claim_twice_credits_once() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.apply_agents(vec![spawn("0xb", "0xo")]).await.unwrap();
        let op = ClaimOp::InsertIfAbsent { claim: claim("0xb", "0x3", ClaimKind::Empty), points: 10 };
        let outcome = store.apply_claims(vec![op.clone(), op]).await.unwrap();

        assert_eq!(outcome.failed, 0);
        assert_eq!(store.claim_count().await.unwrap(), 1);
        assert_eq!(store.agent("0xb").await.unwrap().unwrap().score, 10);
    }

    #[tokio::test]
    async fn reward_overwrites_empty_claim() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.apply_agents(vec![spawn("0xa", "0xo")]).await.unwrap();
        store
            .apply_claims(vec![ClaimOp::InsertIfAbsent { claim: claim("0xa", "0x7", ClaimKind::Empty), points: 10 }])
            .await
            .unwrap();
        let before = store.agent("0xa").await.unwrap().unwrap().score;

        let reward = ClaimOp::Overwrite { claim: claim("0xa", "0x7", ClaimKind::Reward), points: 5000 };
        store.apply_claims(vec![reward.clone(), reward]).await.unwrap();

        let c = store.claim("0xa", "0x7").await.unwrap().unwrap();
        assert_eq!(c.kind, ClaimKind::Reward);
        assert_eq!(store.agent("0xa").await.unwrap().unwrap().score, before + 5000);
    }

    #[tokio::test]
    async fn reward_credit_survives_later_hazard() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.apply_agents(vec![spawn("0xa", "0xo")]).await.unwrap();
        let block = vec![
            ClaimOp::Overwrite { claim: claim("0xa", "0x7", ClaimKind::Reward), points: 5000 },
            ClaimOp::Overwrite { claim: claim("0xa", "0x7", ClaimKind::Hazard), points: 0 },
        ];
        store.apply_claims(block.clone()).await.unwrap();
        store.apply_claims(block).await.unwrap();

        let c = store.claim("0xa", "0x7").await.unwrap().unwrap();
        assert_eq!(c.kind, ClaimKind::Hazard);
        assert_eq!(store.agent("0xa").await.unwrap().unwrap().score, 5000);
    }

    #[tokio::test]
    async fn audit_fields_roundtrip_count() {
        let store = SqliteStore::in_memory().await.unwrap();
        let record = AuditRecord {
            block: 5,
            event_name: "GenericTransfer".into(),
            event_hash: "0x99".into(),
            fields: vec!["0x1".into(), "0x2".into()],
            timestamp: Utc::now(),
        };
        let outcome = store.insert_audit(vec![record.clone(), record]).await.unwrap();
        assert_eq!(outcome.applied(), 2);
        assert_eq!(store.audit_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn snapshot_leaderboard() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .apply_agents(vec![spawn("0xa", "0xo1"), spawn("0xb", "0xo2"), spawn("0xc", "0xo2")])
            .await
            .unwrap();
        store
            .apply_claims(vec![
                ClaimOp::InsertIfAbsent { claim: claim("0xb", "0x1", ClaimKind::Empty), points: 10 },
                ClaimOp::InsertIfAbsent { claim: claim("0xc", "0x1", ClaimKind::Empty), points: 10 },
                ClaimOp::Overwrite { claim: claim("0xa", "0x2", ClaimKind::Hazard), points: 0 },
            ])
            .await
            .unwrap();
        store
            .apply_agents(vec![AgentOp::SetStatus { address: "0xa".into(), status: AgentStatus::Dead }])
            .await
            .unwrap();

        let snap = store.snapshot(10).await.unwrap();
        assert_eq!(snap.total_owners, 2);
        assert_eq!(snap.alive_agents, 2);
        assert_eq!(snap.dead_agents, 1);
        assert_eq!(snap.leaderboard[0], OwnerScore { owner: "0xo2".into(), score: 20 });
        assert_eq!(snap.claims, ClaimCounts { empty: 2, hazard: 1, reward: 0 });
    }
}
