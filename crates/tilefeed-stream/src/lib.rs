//! tilefeed-stream — live fan-out of pending ledger events to WebSocket
//! subscribers, plus the periodic stats channel.
//!
//! # Architecture
//!
//! ```text
//! LivePoller ──offer──► BroadcastBuffer (shared, capped)
//!     ▲                        │ drain (paced per subscriber)
//!     │ refill (low water)     ▼
//!     └──────────────── Hub::tick ──► subscriber sink
//!                              │
//!                              └─ copy of drained items ──► other backlogs
//!
//! StatsPublisher ──broadcast──► /stats subscribers
//! ```

pub mod buffer;
pub mod config;
pub mod delivery;
pub mod hub;
pub mod message;
pub mod pacing;
pub mod poller;
pub mod server;
pub mod stats;
pub mod subscriber;

pub use buffer::{BroadcastBuffer, SubscriberBacklog};
pub use config::{StatsConfig, StreamConfig};
pub use delivery::run_delivery;
pub use hub::{Delivery, DeliverySource, Hub};
pub use message::{ClientAction, ClientMessage, ServerMessage, ViewAck};
pub use pacing::Pacing;
pub use poller::{LivePoller, PollOutcome, PollerHandles, SeenSet};
pub use server::{router, serve, AppState};
pub use stats::StatsPublisher;
pub use subscriber::{ChannelSink, Subscriber, SubscriberId, SubscriberSink, SubscriberState, TileView};
