//! Subscriber wire protocol.
//!
//! Server → client frames are `{"type": ..., "data": ...}`; the only client →
//! server frame is the view control `{action, layer, tileRange}`.

use serde::{Deserialize, Serialize};

use tilefeed_core::{BroadcastItem, FeedError, StatsSnapshot};

/// A frame pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    Transactions(Vec<BroadcastItem>),
    Stats(StatsSnapshot),
    View(ViewAck),
    Error(String),
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, FeedError> {
        serde_json::to_string(self).map_err(|e| FeedError::Other(e.to_string()))
    }
}

/// Echo of the view a subscriber has selected. `tileRange` is `null` after a
/// reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewAck {
    pub layer: Option<String>,
    #[serde(rename = "tileRange")]
    pub tile_range: Option<[u64; 2]>,
}

// ─── Client control ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAction {
    View,
    Reset,
}

/// A tile bound, given either as a number or as a (hex or decimal) string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TileBound {
    Number(u64),
    Text(String),
}

impl TileBound {
    pub fn value(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => parse_location(s),
        }
    }
}

/// `{action, layer, tileRange}` sent by a client on the transactions channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub action: ClientAction,
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default, rename = "tileRange")]
    pub tile_range: Option<(TileBound, TileBound)>,
}

/// Parse a location felt (`0x`-prefixed hex or decimal).
pub fn parse_location(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) if hex.is_empty() => Some(0),
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
