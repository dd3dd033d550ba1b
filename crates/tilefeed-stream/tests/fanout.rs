//! Fan-out behaviour across several subscribers, the poller's backpressure,
//! and the first-joins / last-leaves lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use tilefeed_core::event::selector;
use tilefeed_core::{BroadcastItem, EventKindTable, RawEvent};
use tilefeed_rpc::{BlockScanner, MockLedger};
use tilefeed_stream::{
    run_delivery, ChannelSink, DeliverySource, Hub, LivePoller, StreamConfig, Subscriber,
};

fn item(n: usize) -> BroadcastItem {
    BroadcastItem {
        event_name: "AgentMoved".into(),
        fields: vec![n.to_string()],
        timestamp: chrono::Utc::now(),
        location: None,
    }
}

fn pending(n: usize) -> RawEvent {
    RawEvent::new(
        None,
        vec![selector("AgentMoved")],
        vec!["0xa".into(), format!("0x{n:x}")],
    )
}

fn config(capacity: usize, backlog: usize) -> StreamConfig {
    StreamConfig {
        buffer_capacity: capacity,
        backlog_cap: backlog,
        min_batch: 5,
        max_batch: 50,
        ..Default::default()
    }
}

/// Tick `sub` (ignoring pacing) until `n` items were delivered.
fn collect(
    hub: &Hub,
    sub: &Subscriber,
    n: usize,
    clock: &mut Instant,
) -> Vec<(DeliverySource, String)> {
    let mut out = Vec::new();
    for _ in 0..1_000 {
        if out.len() >= n {
            break;
        }
        *clock += Duration::from_secs(10);
        if let Some(d) = hub.tick_at(sub, *clock) {
            out.extend(d.items.into_iter().map(|i| (d.source, i.fields[0].clone())));
        }
    }
    out
}

fn labels(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|n| n.to_string()).collect()
}

#[test]
fn others_receive_drained_items_from_backlog_first() {
    let hub = Hub::new(config(100, 100));
    let s1 = hub.register();
    let s2 = hub.register();
    let s3 = hub.register();
    let mut clock = Instant::now();

    hub.offer((0..50).map(item).collect());
    let first = collect(&hub, &s1, 50, &mut clock);
    assert_eq!(first.iter().map(|(_, l)| l.clone()).collect::<Vec<_>>(), labels(0..50));
    assert!(first.iter().all(|(src, _)| *src == DeliverySource::Shared));
    assert_eq!(hub.buffer_len(), 0);

    // Newer items arrive after s1 drained the first 50.
    hub.offer((50..60).map(item).collect());

    for sub in [&s2, &s3] {
        assert!(sub.backlog_len() >= 50);
        let got = collect(&hub, sub, 60, &mut clock);
        let (old, new) = got.split_at(50);
        assert!(old.iter().all(|(src, _)| *src == DeliverySource::Backlog));
        assert_eq!(old.iter().map(|(_, l)| l.clone()).collect::<Vec<_>>(), labels(0..50));
        assert_eq!(new.iter().map(|(_, l)| l.clone()).collect::<Vec<_>>(), labels(50..60));
    }
}

#[test]
fn backlog_cap_evicts_oldest() {
    let hub = Hub::new(config(100, 20));
    let s1 = hub.register();
    let s2 = hub.register();
    let mut clock = Instant::now();

    hub.offer((0..50).map(item).collect());
    collect(&hub, &s1, 50, &mut clock);
    assert_eq!(s2.backlog_len(), 20);

    let got = collect(&hub, &s2, 20, &mut clock);
    assert_eq!(got.iter().map(|(_, l)| l.clone()).collect::<Vec<_>>(), labels(30..50));
}

#[tokio::test]
async fn poller_respects_capacity_and_keeps_overflow() {
    let ledger = Arc::new(MockLedger::new(1));
    ledger.push_pending((0..30).map(pending).collect());

    let cfg = config(10, 100);
    let hub = Hub::new(cfg.clone());
    let sub = hub.register();
    let mut poller = LivePoller::new(
        BlockScanner::new(ledger.clone(), 100),
        Arc::new(EventKindTable::default()),
        hub.handles(),
        &cfg,
    );

    let first = poller.poll_once().await.unwrap();
    assert_eq!((first.fetched, first.pushed, first.overflow), (30, 10, 20));
    assert_eq!(hub.buffer_len(), 10);

    let skipped = poller.poll_once().await.unwrap();
    assert!(skipped.skipped);
    assert_eq!(ledger.page_calls(), 1, "no fetch while the buffer is full");

    let mut clock = Instant::now();
    let mut delivered = Vec::new();
    while delivered.len() < 30 {
        clock += Duration::from_secs(10);
        if let Some(d) = hub.tick_at(&sub, clock) {
            delivered.extend(d.items.into_iter().map(|i| i.fields[1].clone()));
        }
        let o = poller.poll_once().await.unwrap();
        assert!(hub.buffer_len() <= 10);
        if poller.overflow_len() > 0 {
            assert!(o.skipped);
        }
    }

    let expected: Vec<String> = (0..30).map(|n| format!("0x{n:x}")).collect();
    assert_eq!(delivered, expected, "overflow is delivered in order, nothing dropped");
    // Once the overflow drained, fetching resumes and the repeats are suppressed.
    assert!(ledger.page_calls() > 1);
    assert_eq!(hub.buffer_len(), 0);
}

#[tokio::test]
async fn last_leave_stops_poller_and_next_join_restarts() {
    let ledger = Arc::new(MockLedger::new(1));
    ledger.push_pending((0..5).map(pending).collect());
    let cfg = StreamConfig { poll_interval_ms: 10, ..config(100, 100) };
    let hub = Hub::new(cfg).with_source(
        BlockScanner::new(ledger.clone(), 100),
        Arc::new(EventKindTable::default()),
    );

    let a = hub.register();
    assert!(hub.is_polling());
    wait_for(|| hub.buffer_len() == 5).await;

    hub.unregister(a.id());
    assert!(!hub.is_polling());
    assert_eq!(hub.buffer_len(), 0);

    // A fresh poller has an empty seen-set, so the window is fetched again.
    let b = hub.register();
    assert!(hub.is_polling());
    wait_for(|| hub.buffer_len() == 5).await;
    hub.unregister(b.id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_racing_last_leave_keeps_a_poller() {
    let ledger = Arc::new(MockLedger::new(1));
    let cfg = StreamConfig { poll_interval_ms: 10, ..config(100, 100) };
    let hub = Arc::new(Hub::new(cfg).with_source(
        BlockScanner::new(ledger, 100),
        Arc::new(EventKindTable::default()),
    ));

    for _ in 0..2_000 {
        let a = hub.register();
        let leave = {
            let hub = hub.clone();
            tokio::task::spawn_blocking(move || hub.unregister(a.id()))
        };
        let join = {
            let hub = hub.clone();
            tokio::task::spawn_blocking(move || hub.register())
        };
        assert!(leave.await.unwrap());
        let b = join.await.unwrap();

        assert_eq!(hub.subscriber_count(), 1);
        assert!(hub.is_polling(), "a registered subscriber always has a poller");
        hub.unregister(b.id());
        assert!(!hub.is_polling());
    }
}

#[tokio::test]
async fn draining_under_low_water_refetches_early() {
    let ledger = Arc::new(MockLedger::new(1));
    ledger.push_pending((0..8).map(pending).collect());
    let cfg = StreamConfig {
        poll_interval_ms: 60_000,
        low_water_mark: 5,
        ..config(100, 100)
    };
    let hub = Hub::new(cfg).with_source(
        BlockScanner::new(ledger.clone(), 100),
        Arc::new(EventKindTable::default()),
    );

    let sub = hub.register();
    wait_for(|| hub.buffer_len() == 8).await;
    assert_eq!(ledger.page_calls(), 1);

    let d = hub.tick(&sub).unwrap();
    assert_eq!(d.drained, 5);
    assert_eq!(hub.buffer_len(), 3);

    // Far sooner than the 60 s poll interval.
    wait_for(|| ledger.page_calls() >= 2).await;
    hub.unregister(sub.id());
}

#[tokio::test]
async fn end_to_end_delivery_over_channel() {
    let ledger = Arc::new(MockLedger::new(1));
    ledger.push_pending((0..12).map(pending).collect());
    let cfg = StreamConfig {
        poll_interval_ms: 10,
        base_send_interval_ms: 20,
        min_send_interval_ms: 5,
        ..config(100, 100)
    };
    let hub = Arc::new(Hub::new(cfg).with_source(
        BlockScanner::new(ledger, 100),
        Arc::new(EventKindTable::default()),
    ));

    let sub = hub.register();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_delivery(hub.clone(), sub.clone(), ChannelSink(tx)));

    let mut names = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while names.len() < 12 {
            let frame: serde_json::Value =
                serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["type"], "transactions");
            for item in frame["data"].as_array().unwrap() {
                names.push(item["event_name"].as_str().unwrap().to_string());
            }
        }
    })
    .await
    .expect("all pending events delivered");

    assert!(names.iter().all(|n| n == "AgentMoved"));
    hub.unregister(sub.id());
    task.await.unwrap().unwrap();
    assert!(!hub.is_polling());
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}
