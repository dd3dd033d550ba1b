//! The live poller — reads the pending window and feeds the shared buffer.
//!
//! Cadence is a fixed base interval, cut short when a subscriber drains the
//! buffer under the low-water mark. While the buffer is full, or while events
//! from an earlier page are still waiting for room, no fetch is made.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use tilefeed_core::{BroadcastItem, EventKindTable, FeedError, RawEvent};
use tilefeed_rpc::{BlockId, BlockScanner};

use crate::buffer::{lock, BroadcastBuffer};
use crate::config::StreamConfig;

/// Shared state between a [`crate::Hub`] and its poller.
#[derive(Clone)]
pub struct PollerHandles {
    pub buffer: Arc<Mutex<BroadcastBuffer>>,
    /// Notified by subscribers when the buffer runs low.
    pub refill: Arc<Notify>,
    /// Notified by the poller after pushing items.
    pub items_ready: Arc<Notify>,
    /// Cleared when the hub stops this poller; checked under the buffer lock
    /// so a stopped poller never refills a cleared buffer.
    pub active: Arc<AtomicBool>,
}

impl PollerHandles {
    pub fn new(
        buffer: Arc<Mutex<BroadcastBuffer>>,
        refill: Arc<Notify>,
        items_ready: Arc<Notify>,
    ) -> Self {
        Self {
            buffer,
            refill,
            items_ready,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// The shared buffer, or `None` once the poller was stopped.
    fn buffer(&self) -> Option<MutexGuard<'_, BroadcastBuffer>> {
        let buf = lock(&self.buffer);
        self.is_active().then_some(buf)
    }
}

// ─── SeenSet ──────────────────────────────────────────────────────────────────

/// Bounded set of recently observed event identities (FIFO eviction).
#[derive(Debug)]
pub struct SeenSet {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: String) -> bool {
        if self.set.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.order.push_back(id.clone());
        self.set.insert(id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ─── LivePoller ───────────────────────────────────────────────────────────────

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// No page was fetched (buffer full, overflow pending or poller stopped).
    pub skipped: bool,
    /// Items moved from the overflow into the buffer.
    pub from_overflow: usize,
    /// Events in the fetched page.
    pub fetched: usize,
    /// Fetched events not seen before.
    pub fresh: usize,
    /// Items pushed into the buffer this cycle (overflow included).
    pub pushed: usize,
    /// Items still waiting for room.
    pub overflow: usize,
}

pub struct LivePoller {
    scanner: BlockScanner,
    table: Arc<EventKindTable>,
    handles: PollerHandles,
    interval: Duration,
    token: Option<String>,
    overflow: VecDeque<BroadcastItem>,
    seen: SeenSet,
}

impl LivePoller {
    pub fn new(
        scanner: BlockScanner,
        table: Arc<EventKindTable>,
        handles: PollerHandles,
        config: &StreamConfig,
    ) -> Self {
        Self {
            scanner,
            table,
            handles,
            interval: config.poll_interval(),
            token: None,
            overflow: VecDeque::new(),
            seen: SeenSet::new(config.seen_capacity),
        }
    }

    /// Format a pending event for subscribers.
    pub fn to_item(table: &EventKindTable, event: &RawEvent) -> BroadcastItem {
        let kind = table.classify(event).kind;
        BroadcastItem {
            event_name: kind.name().to_string(),
            fields: event.fields.clone(),
            timestamp: event.observed_at,
            location: kind
                .location_index()
                .and_then(|i| event.field(i))
                .map(str::to_string),
        }
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// One poll cycle. On a fetch error the continuation token is reset.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, FeedError> {
        let mut outcome = PollOutcome::default();

        // Overflow first, in order.
        let full = {
            let Some(mut buf) = self.handles.buffer() else {
                outcome.skipped = true;
                return Ok(outcome);
            };
            while !buf.is_full() {
                match self.overflow.pop_front() {
                    Some(item) => {
                        let _ = buf.push(item);
                        outcome.from_overflow += 1;
                    }
                    None => break,
                }
            }
            buf.is_full()
        };
        outcome.pushed = outcome.from_overflow;

        if full || !self.overflow.is_empty() {
            outcome.skipped = true;
            outcome.overflow = self.overflow.len();
            self.signal(&outcome);
            return Ok(outcome);
        }

        let page = match self.scanner.scan_page(BlockId::Pending, self.token.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                self.token = None;
                self.signal(&outcome);
                return Err(e);
            }
        };
        self.token = page.continuation_token;
        outcome.fetched = page.events.len();

        let fresh: Vec<BroadcastItem> = page
            .events
            .iter()
            .filter(|e| self.seen.insert(e.identity()))
            .map(|e| Self::to_item(&self.table, e))
            .collect();
        outcome.fresh = fresh.len();

        let rest = match self.handles.buffer() {
            Some(mut buf) => buf.offer(fresh),
            None => return Ok(outcome),
        };
        outcome.pushed += outcome.fresh - rest.len();
        self.overflow.extend(rest);
        outcome.overflow = self.overflow.len();

        self.signal(&outcome);
        Ok(outcome)
    }

    fn signal(&self, outcome: &PollOutcome) {
        if outcome.pushed > 0 {
            self.handles.items_ready.notify_waiters();
        }
    }

    /// Poll until the task is aborted.
    pub async fn run(mut self) {
        loop {
            match self.poll_once().await {
                Ok(o) if o.skipped => debug!(overflow = o.overflow, "buffer full, fetch skipped"),
                Ok(o) => debug!(
                    fetched = o.fetched,
                    fresh = o.fresh,
                    pushed = o.pushed,
                    overflow = o.overflow,
                    "pending window polled"
                ),
                Err(e) => warn!(error = %e, "pending poll failed, token reset"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.handles.refill.notified() => {
                    debug!("buffer under low-water mark, refetching");
                }
            }
        }
    }
}
