//! Entity and event types shared by ingestion and fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── RawEvent ─────────────────────────────────────────────────────────────────

/// A ledger event exactly as fetched from the RPC, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Block the event was emitted in; `None` for pending-window events.
    pub block_number: Option<u64>,
    /// Event keys; `keys[0]` is the event selector hash.
    pub keys: Vec<String>,
    /// Event payload (`data` on the wire).
    pub fields: Vec<String>,
    /// Emitting transaction, when the ledger reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Emitting contract, when the ledger reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    /// When this process fetched the event.
    pub observed_at: DateTime<Utc>,
}

impl RawEvent {
    /// Create an event observed now with no transaction metadata.
    pub fn new(block_number: Option<u64>, keys: Vec<String>, fields: Vec<String>) -> Self {
        Self {
            block_number,
            keys,
            fields,
            tx_hash: None,
            from_address: None,
            observed_at: Utc::now(),
        }
    }

    /// The event selector (`keys[0]`), if present.
    pub fn selector(&self) -> Option<&str> {
        self.keys.first().map(String::as_str)
    }

    /// Payload field at `index`, if present.
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Returns `true` if the event has not been included in a block yet.
    pub fn is_pending(&self) -> bool {
        self.block_number.is_none()
    }

    /// A stable identity for de-duplicating re-observed pending events.
    pub fn identity(&self) -> String {
        format!(
            "{}|{}|{}",
            self.tx_hash.as_deref().unwrap_or("-"),
            self.keys.join(","),
            self.fields.join(",")
        )
    }
}

// ─── Agent ────────────────────────────────────────────────────────────────────

/// Liveness of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Alive,
    Dead,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Dead => "dead",
        }
    }

    /// Parse the stored representation. Unknown values read as `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "alive" => Some(Self::Alive),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A spawned agent. Keyed by `address`; never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub address: String,
    pub owner: String,
    pub status: AgentStatus,
    pub score: i64,
    pub origin_location: String,
}

// ─── LocationClaim ────────────────────────────────────────────────────────────

/// What an agent found at a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimKind {
    Empty,
    Hazard,
    Reward,
}

impl ClaimKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Hazard => "hazard",
            Self::Reward => "reward",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "empty" => Some(Self::Empty),
            "hazard" => Some(Self::Hazard),
            "reward" => Some(Self::Reward),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claim on a location. Unique per `(agent_address, location)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationClaim {
    pub agent_address: String,
    pub location: String,
    pub kind: ClaimKind,
    pub claimed_at: DateTime<Utc>,
}

impl LocationClaim {
    /// The uniqueness key of this claim.
    pub fn key(&self) -> (String, String) {
        (self.agent_address.clone(), self.location.clone())
    }
}

// ─── AuditRecord ──────────────────────────────────────────────────────────────

/// Append-only record of one processed ledger event, mapped or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub block: u64,
    pub event_name: String,
    pub event_hash: String,
    pub fields: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

// ─── BroadcastItem ────────────────────────────────────────────────────────────

/// A live event formatted for subscribers. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastItem {
    pub event_name: String,
    #[serde(rename = "data")]
    pub fields: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Location the event refers to, used for tile-scoped views.
    #[serde(skip)]
    pub location: Option<String>,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_accessors() {
        let ev = RawEvent::new(
            Some(12),
            vec!["0xabc".into(), "0x1".into()],
            vec!["0xagent".into(), "0xowner".into()],
        );
        assert_eq!(ev.selector(), Some("0xabc"));
        assert_eq!(ev.field(1), Some("0xowner"));
        assert_eq!(ev.field(2), None);
        assert!(!ev.is_pending());
    }

    #[test]
    fn identity_distinguishes_payloads() {
        let a = RawEvent::new(None, vec!["0x1".into()], vec!["0xa".into()]);
        let mut b = a.clone();
        assert_eq!(a.identity(), b.identity());
        b.fields.push("0xb".into());
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn broadcast_item_wire_shape() {
        let item = BroadcastItem {
            event_name: "RewardFound".into(),
            fields: vec!["0xa".into(), "0x0".into(), "0x7".into()],
            timestamp: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            location: Some("0x7".into()),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["event_name"], "RewardFound");
        assert_eq!(json["data"][2], "0x7");
        assert!(json.get("location").is_none());
        assert!(json["timestamp"].as_str().unwrap().starts_with("2024-01-01T00:00:00"));
    }

    #[test]
    fn status_and_kind_parse() {
        assert_eq!(AgentStatus::parse("dead"), Some(AgentStatus::Dead));
        assert_eq!(ClaimKind::parse(ClaimKind::Reward.as_str()), Some(ClaimKind::Reward));
        assert_eq!(ClaimKind::parse("gold"), None);
    }
}
