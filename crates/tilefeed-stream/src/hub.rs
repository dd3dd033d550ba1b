//! The fan-out coordinator.
//!
//! One [`Hub`] owns the shared buffer, the subscriber table and the poller
//! task. Lifecycle:
//!
//! - the first subscriber to join starts the poller;
//! - each tick drains the subscriber's backlog first and only then the shared
//!   buffer; items taken from the shared buffer are copied into every other
//!   subscriber's backlog;
//! - when the last subscriber leaves, the poller is stopped and the buffer is
//!   cleared, so the next join starts from a clean state.
//!
//! Membership changes and poller start/stop happen under one lock, so a join
//! racing the last leave always ends with a running poller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use tilefeed_core::{BroadcastItem, EventKindTable};
use tilefeed_rpc::BlockScanner;

use crate::buffer::{lock, BroadcastBuffer};
use crate::config::StreamConfig;
use crate::pacing::Pacing;
use crate::poller::{LivePoller, PollerHandles};
use crate::subscriber::{Subscriber, SubscriberId, SubscriberState, TileView};

/// Where a tick's items came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySource {
    Backlog,
    Shared,
}

/// Items released to one subscriber by one tick.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub source: DeliverySource,
    /// Items before the subscriber's view was applied.
    pub drained: usize,
    /// Items to send, after the view was applied.
    pub items: Vec<BroadcastItem>,
    /// Items pending for this subscriber (shared buffer plus its backlog)
    /// when the pacing was computed.
    pub depth: usize,
    /// Wait before the subscriber's next tick.
    pub next_in: Duration,
}

/// The pending-window source a hub polls while it has subscribers.
struct PollSource {
    scanner: BlockScanner,
    table: Arc<EventKindTable>,
}

struct RunningPoller {
    task: JoinHandle<()>,
    handles: PollerHandles,
}

/// Subscriber table and poller, guarded together.
#[derive(Default)]
struct LiveState {
    subscribers: HashMap<SubscriberId, Arc<Subscriber>>,
    poller: Option<RunningPoller>,
}

pub struct Hub {
    config: StreamConfig,
    pacing: Pacing,
    buffer: Arc<Mutex<BroadcastBuffer>>,
    live: Mutex<LiveState>,
    next_id: AtomicU64,
    source: Option<PollSource>,
    /// Wakes the poller for an out-of-band fetch.
    refill: Arc<Notify>,
    /// Wakes delivery tasks when new items land in the buffer.
    items_ready: Arc<Notify>,
}

impl Hub {
    /// A hub without a poller; items arrive through [`Hub::offer`].
    pub fn new(config: StreamConfig) -> Self {
        Self {
            pacing: Pacing::from_config(&config),
            buffer: Arc::new(Mutex::new(BroadcastBuffer::new(config.buffer_capacity))),
            live: Mutex::new(LiveState::default()),
            next_id: AtomicU64::new(1),
            source: None,
            refill: Arc::new(Notify::new()),
            items_ready: Arc::new(Notify::new()),
            config,
        }
    }

    /// Poll the pending window through `scanner` while subscribers exist.
    pub fn with_source(mut self, scanner: BlockScanner, table: Arc<EventKindTable>) -> Self {
        self.source = Some(PollSource { scanner, table });
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    /// Shared state a [`LivePoller`] needs to feed this hub.
    pub fn handles(&self) -> PollerHandles {
        PollerHandles::new(
            self.buffer.clone(),
            self.refill.clone(),
            self.items_ready.clone(),
        )
    }

    // ─── Membership ─────────────────────────────────────────────────────────────

    /// Add a subscriber. The first one starts the poller.
    pub fn register(&self) -> Arc<Subscriber> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscriber::new(id, self.config.backlog_cap));

        let mut live = lock(&self.live);
        live.subscribers.insert(id, sub.clone());
        info!(subscriber = id, "subscriber registered");
        if live.subscribers.len() == 1 {
            self.start_poller(&mut live);
        }
        sub
    }

    /// Remove a subscriber. The last one stops the poller and clears the
    /// buffer. Returns `false` if `id` was not registered.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut live = lock(&self.live);
        let Some(sub) = live.subscribers.remove(&id) else {
            return false;
        };
        sub.close();
        info!(subscriber = id, "subscriber removed");

        if live.subscribers.is_empty() {
            Self::stop_poller(&mut live);
            lock(&self.buffer).clear();
            debug!("last subscriber left, live state cleared");
        }
        true
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.live).subscribers.len()
    }

    pub fn subscriber(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        lock(&self.live).subscribers.get(&id).cloned()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.live)
            .poller
            .as_ref()
            .is_some_and(|p| !p.task.is_finished())
    }

    fn start_poller(&self, live: &mut LiveState) {
        let Some(source) = &self.source else {
            return;
        };
        if live.poller.as_ref().is_some_and(|p| !p.task.is_finished()) {
            return;
        }
        let handles = self.handles();
        let poller = LivePoller::new(
            source.scanner.clone(),
            source.table.clone(),
            handles.clone(),
            &self.config,
        );
        live.poller = Some(RunningPoller { task: tokio::spawn(poller.run()), handles });
        info!("live poller started");
    }

    /// Must be followed by clearing the buffer while `live` is still held.
    fn stop_poller(live: &mut LiveState) {
        if let Some(poller) = live.poller.take() {
            poller.handles.deactivate();
            poller.task.abort();
            info!("live poller stopped");
        }
    }

    // ─── Buffer ─────────────────────────────────────────────────────────────────

    /// Push items into the shared buffer; returns those that did not fit.
    pub fn offer(&self, items: Vec<BroadcastItem>) -> Vec<BroadcastItem> {
        let (rest, pushed) = {
            let mut buf = lock(&self.buffer);
            let before = buf.len();
            let rest = buf.offer(items);
            (rest, buf.len() > before)
        };
        if pushed {
            self.items_ready.notify_waiters();
        }
        rest
    }

    pub fn buffer_len(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Resolves when new items were pushed into the shared buffer.
    pub async fn items_ready(&self) {
        self.items_ready.notified().await
    }

    pub fn set_view(&self, id: SubscriberId, view: Option<TileView>) -> bool {
        match self.subscriber(id) {
            Some(sub) => {
                sub.set_view(view);
                true
            }
            None => false,
        }
    }

    // ─── Delivery ───────────────────────────────────────────────────────────────

    /// Run one delivery tick for `sub` now.
    pub fn tick(&self, sub: &Subscriber) -> Option<Delivery> {
        self.tick_at(sub, Instant::now())
    }

    /// Run one delivery tick as of `now`. Returns `None` if the subscriber's
    /// next send time has not come yet.
    pub fn tick_at(&self, sub: &Subscriber, now: Instant) -> Option<Delivery> {
        if sub.is_closed() || now < *lock(&sub.next_send_at) {
            return None;
        }

        let depth = self.buffer_len() + sub.backlog_len();
        let k = self.pacing.batch_size(depth);

        let from_backlog = lock(&sub.backlog).drain(k);
        let (source, drained) = if !from_backlog.is_empty() {
            (DeliverySource::Backlog, from_backlog)
        } else {
            let (drained, left) = {
                let mut buf = lock(&self.buffer);
                let drained = buf.drain(k);
                (drained, buf.len())
            };
            if !drained.is_empty() {
                self.mirror(sub.id(), &drained);
                if left < self.config.low_water_mark {
                    self.refill.notify_one();
                }
            }
            (DeliverySource::Shared, drained)
        };

        let next_in = self.pacing.wait(depth);
        *lock(&sub.next_send_at) = now + next_in;

        let count = drained.len();
        let items = sub.visible(drained);
        if count > 0 {
            sub.set_state(SubscriberState::Streaming);
        }
        Some(Delivery { source, drained: count, items, depth, next_in })
    }

    /// Copy `items` into every subscriber's backlog except `except`.
    fn mirror(&self, except: SubscriberId, items: &[BroadcastItem]) {
        let others: Vec<Arc<Subscriber>> = lock(&self.live)
            .subscribers
            .iter()
            .filter(|(id, _)| **id != except)
            .map(|(_, s)| s.clone())
            .collect();
        for other in others {
            lock(&other.backlog).extend(items);
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        Self::stop_poller(&mut lock(&self.live));
    }
}
