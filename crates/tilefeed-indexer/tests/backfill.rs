//! End-to-end backfill runs over a scripted ledger and the in-memory store.

use std::sync::Arc;

use tilefeed_core::checkpoint::{CheckpointStore, LAST_PROCESSED_BLOCK};
use tilefeed_core::event::selector;
use tilefeed_core::{AgentStatus, ClaimKind, Collection, EntityStore, EventKindTable, RawEvent};
use tilefeed_indexer::{BackfillBuilder, BackfillEvent};
use tilefeed_rpc::MockLedger;
use tilefeed_storage::MemoryStore;

fn ev(block: u64, name: &str, fields: &[&str]) -> RawEvent {
    RawEvent::new(
        Some(block),
        vec![selector(name)],
        fields.iter().map(|s| s.to_string()).collect(),
    )
}

/// Three blocks of game activity plus one unmapped event.
fn scripted_ledger() -> Arc<MockLedger> {
    let ledger = Arc::new(MockLedger::new(12));
    ledger.set_block(
        10,
        vec![
            ev(10, "AgentSpawned", &["0xa", "0xowner1", "0x1"]),
            ev(10, "AgentSpawned", &["0xb", "0xowner2", "0x2"]),
        ],
    );
    ledger.set_block(
        11,
        vec![
            ev(11, "TileClaimedEmpty", &["0xa", "0x0", "0x7"]),
            ev(11, "TileClaimedEmpty", &["0xb", "0x0", "0x3"]),
            ev(11, "TileClaimedEmpty", &["0xb", "0x0", "0x3"]),
            ev(11, "SomethingElse", &["0x1"]),
        ],
    );
    ledger.set_block(
        12,
        vec![
            ev(12, "RewardFound", &["0xa", "0x0", "0x7"]),
            ev(12, "HazardFound", &["0xb", "0x9"]),
        ],
    );
    ledger
}

fn table() -> Arc<EventKindTable> {
    Arc::new(EventKindTable::default())
}

#[tokio::test]
async fn applies_game_rules() {
    let ledger = scripted_ledger();
    let store = Arc::new(MemoryStore::new());
    let mut backfill = BackfillBuilder::new()
        .genesis_block(10)
        .chunk_size(2)
        .retry_delay_ms(1)
        .build(ledger, store.clone(), table());

    let summary = backfill.run().await.unwrap();
    assert_eq!(summary.blocks, 3);
    assert_eq!(summary.events, 8);

    let a = store.agent("0xa").await.unwrap().unwrap();
    assert_eq!(a.score, 5000 + 10, "reward credited once on top of the empty claim");
    assert_eq!(a.status, AgentStatus::Alive);
    assert_eq!(store.claim("0xa", "0x7").await.unwrap().unwrap().kind, ClaimKind::Reward);

    let b = store.agent("0xb").await.unwrap().unwrap();
    assert_eq!(b.score, 10, "duplicate empty claim credits once");
    assert_eq!(b.status, AgentStatus::Dead);
    assert_eq!(store.claim("0xb", "0x9").await.unwrap().unwrap().kind, ClaimKind::Hazard);
    assert_eq!(store.claim_count().await.unwrap(), 3);

    assert_eq!(store.audit_count().await.unwrap(), 8);
    let audit = store.audit().unwrap();
    assert!(audit.iter().any(|r| r.event_name == "GenericTransfer"));

    let cp = store.load(LAST_PROCESSED_BLOCK).await.unwrap().unwrap();
    assert_eq!(cp.block_number, 12);
}

#[tokio::test]
async fn replaying_blocks_converges() {
    let ledger = scripted_ledger();
    let store = Arc::new(MemoryStore::new());

    BackfillBuilder::new()
        .genesis_block(10)
        .retry_delay_ms(1)
        .build(ledger.clone(), store.clone(), table())
        .run()
        .await
        .unwrap();
    let agents = store.agents().unwrap();
    let claims: Vec<_> = store
        .claims()
        .unwrap()
        .into_iter()
        .map(|c| (c.agent_address, c.location, c.kind))
        .collect();

    // Same blocks again under a different checkpoint key.
    BackfillBuilder::new()
        .checkpoint_key("replay")
        .genesis_block(10)
        .retry_delay_ms(1)
        .build(ledger, store.clone(), table())
        .run()
        .await
        .unwrap();
    let replay_claims: Vec<_> = store
        .claims()
        .unwrap()
        .into_iter()
        .map(|c| (c.agent_address, c.location, c.kind))
        .collect();

    assert_eq!(store.agents().unwrap(), agents);
    assert_eq!(replay_claims, claims);
    // The audit trail is append-only: one record per scanned event per run.
    assert_eq!(store.audit_count().await.unwrap(), 16);
}

#[tokio::test]
async fn restart_replays_checkpoint_block_without_recrediting() {
    let ledger = Arc::new(MockLedger::new(2));
    ledger.set_block(1, vec![ev(1, "AgentSpawned", &["0xa", "0xowner", "0x1"])]);
    ledger.set_block(
        2,
        vec![
            ev(2, "RewardFound", &["0xa", "0x0", "0x7"]),
            ev(2, "HazardFound", &["0xa", "0x7"]),
        ],
    );
    let store = Arc::new(MemoryStore::new());
    let run = || {
        BackfillBuilder::new()
            .genesis_block(1)
            .retry_delay_ms(1)
            .build(ledger.clone(), store.clone(), table())
    };

    run().run().await.unwrap();
    let first = store.agent("0xa").await.unwrap().unwrap();
    assert_eq!(first.score, 5000);

    // Restart resumes at checkpoint 2 and applies that block again.
    let summary = run().run().await.unwrap();
    assert_eq!(summary.from_block, 2);

    let again = store.agent("0xa").await.unwrap().unwrap();
    assert_eq!(again, first);
    assert_eq!(again.status, AgentStatus::Dead);
    assert_eq!(store.claim("0xa", "0x7").await.unwrap().unwrap().kind, ClaimKind::Hazard);
}

#[tokio::test]
async fn resumes_at_checkpoint() {
    let ledger = scripted_ledger();
    let store = Arc::new(MemoryStore::new());
    BackfillBuilder::new()
        .genesis_block(10)
        .to_block(11)
        .retry_delay_ms(1)
        .build(ledger.clone(), store.clone(), table())
        .run()
        .await
        .unwrap();
    assert_eq!(store.load(LAST_PROCESSED_BLOCK).await.unwrap().unwrap().block_number, 11);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let summary = BackfillBuilder::new()
        .genesis_block(0)
        .retry_delay_ms(1)
        .build(ledger, store.clone(), table())
        .with_events(tx)
        .run()
        .await
        .unwrap();

    // Block 11 is processed again, then 12.
    assert_eq!(summary.from_block, 11);
    assert_eq!(summary.blocks, 2);

    let mut blocks = vec![];
    while let Ok(ev) = rx.try_recv() {
        if let BackfillEvent::Progress { block, .. } = ev {
            blocks.push(block);
        }
    }
    assert_eq!(blocks, vec![11, 12], "checkpoint advances in increasing order");
    assert_eq!(store.agent("0xb").await.unwrap().unwrap().score, 10);
}

#[tokio::test]
async fn rpc_failures_retry_the_same_block() {
    let ledger = scripted_ledger();
    ledger.fail_next(3);
    let store = Arc::new(MemoryStore::new());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let summary = BackfillBuilder::new()
        .genesis_block(10)
        .retry_delay_ms(1)
        .build(ledger, store.clone(), table())
        .with_events(tx)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.retries, 3);
    assert_eq!(summary.blocks, 3);
    assert_eq!(store.audit_count().await.unwrap(), 8);

    let mut retried = 0;
    while let Ok(ev) = rx.try_recv() {
        if let BackfillEvent::Retrying { block, .. } = ev {
            assert_eq!(block, 10);
            retried += 1;
        }
    }
    assert_eq!(retried, 3);
}

#[tokio::test]
async fn failed_batch_does_not_block_siblings() {
    let ledger = scripted_ledger();
    let store = Arc::new(MemoryStore::new());
    store.fail_collection(Collection::Claims);

    BackfillBuilder::new()
        .genesis_block(10)
        .retry_delay_ms(1)
        .build(ledger, store.clone(), table())
        .run()
        .await
        .unwrap();

    assert_eq!(store.claim_count().await.unwrap(), 0);
    assert_eq!(store.audit_count().await.unwrap(), 8);
    assert_eq!(
        store.agent("0xb").await.unwrap().unwrap().status,
        AgentStatus::Dead,
        "agents batch applied although claims failed"
    );
    assert_eq!(store.load(LAST_PROCESSED_BLOCK).await.unwrap().unwrap().block_number, 12);
}
