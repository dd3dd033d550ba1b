//! Per-subscriber state and the sink a delivery task writes to.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use tilefeed_core::{BroadcastItem, FeedError};

use crate::buffer::{lock, SubscriberBacklog};
use crate::message::{parse_location, ServerMessage, ViewAck};

pub type SubscriberId = u64;

/// `Registered → Streaming → Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Joined, nothing delivered yet.
    Registered,
    /// At least one batch delivered.
    Streaming,
    /// Disconnected or failed a send. Terminal.
    Removed,
}

// ─── TileView ─────────────────────────────────────────────────────────────────

/// Restricts delivery to items whose location falls in `[lo, hi]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileView {
    pub layer: Option<String>,
    pub lo: u64,
    pub hi: u64,
}

impl TileView {
    pub fn new(layer: Option<String>, a: u64, b: u64) -> Self {
        Self { layer, lo: a.min(b), hi: a.max(b) }
    }

    /// Items without a parseable location are outside every view.
    pub fn contains(&self, item: &BroadcastItem) -> bool {
        item.location
            .as_deref()
            .and_then(parse_location)
            .is_some_and(|loc| loc >= self.lo && loc <= self.hi)
    }

    pub fn ack(&self) -> ViewAck {
        ViewAck { layer: self.layer.clone(), tile_range: Some([self.lo, self.hi]) }
    }
}

// ─── Subscriber ───────────────────────────────────────────────────────────────

/// One live connection on the transactions channel.
pub struct Subscriber {
    id: SubscriberId,
    pub(crate) backlog: Mutex<SubscriberBacklog>,
    pub(crate) next_send_at: Mutex<Instant>,
    state: Mutex<SubscriberState>,
    view: Mutex<Option<TileView>>,
    notices: Mutex<VecDeque<ServerMessage>>,
    closed: AtomicBool,
    wake: Notify,
}

impl Subscriber {
    pub(crate) fn new(id: SubscriberId, backlog_cap: usize) -> Self {
        Self {
            id,
            backlog: Mutex::new(SubscriberBacklog::new(backlog_cap)),
            next_send_at: Mutex::new(Instant::now()),
            state: Mutex::new(SubscriberState::Registered),
            view: Mutex::new(None),
            notices: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn state(&self) -> SubscriberState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: SubscriberState) {
        let mut current = lock(&self.state);
        if *current != SubscriberState::Removed {
            *current = state;
        }
    }

    pub fn backlog_len(&self) -> usize {
        lock(&self.backlog).len()
    }

    pub fn view(&self) -> Option<TileView> {
        lock(&self.view).clone()
    }

    /// Select (or clear) the tile view and queue its acknowledgement.
    pub fn set_view(&self, view: Option<TileView>) {
        let ack = match &view {
            Some(v) => v.ack(),
            None => ViewAck { layer: None, tile_range: None },
        };
        *lock(&self.view) = view;
        self.notify(ServerMessage::View(ack));
    }

    /// Queue an out-of-band frame for the delivery task.
    pub fn notify(&self, msg: ServerMessage) {
        lock(&self.notices).push_back(msg);
        self.wake.notify_one();
    }

    pub(crate) fn take_notices(&self) -> Vec<ServerMessage> {
        lock(&self.notices).drain(..).collect()
    }

    /// Keep only the items this subscriber's view admits.
    pub(crate) fn visible(&self, items: Vec<BroadcastItem>) -> Vec<BroadcastItem> {
        match &*lock(&self.view) {
            Some(view) => items.into_iter().filter(|i| view.contains(i)).collect(),
            None => items,
        }
    }

    /// Mark the subscriber removed and stop its delivery task.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(SubscriberState::Removed);
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await
    }
}

// ─── Sinks ────────────────────────────────────────────────────────────────────

/// Where a subscriber's frames go.
#[async_trait]
pub trait SubscriberSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError>;
}

/// Sink backed by an unbounded channel; the receiver sees every frame.
pub struct ChannelSink(pub mpsc::UnboundedSender<String>);

#[async_trait]
impl SubscriberSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.0
            .send(text)
            .map_err(|_| FeedError::Other("channel receiver dropped".into()))
    }
}
