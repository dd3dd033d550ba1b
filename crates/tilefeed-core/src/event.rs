//! Event model and classifier.
//!
//! Maps a [`RawEvent`] to its [`EventKind`] through a fixed selector table and
//! derives the [`MutationPlan`] the event implies. Everything here is pure.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

use crate::error::FeedError;
use crate::types::RawEvent;

/// Points credited when an agent claims an empty location for the first time.
pub const EMPTY_CLAIM_POINTS: i64 = 10;

/// Points credited when a location turns into a reward.
pub const REWARD_POINTS: i64 = 5000;

// ─── EventKind ────────────────────────────────────────────────────────────────

/// Semantic kind of a ledger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    AgentSpawned,
    TileClaimedEmpty,
    RewardFound,
    HazardFound,
    AgentMoved,
    Transfer,
    Approval,
    /// Any selector missing from the table.
    GenericTransfer,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentSpawned => "AgentSpawned",
            Self::TileClaimedEmpty => "TileClaimedEmpty",
            Self::RewardFound => "RewardFound",
            Self::HazardFound => "HazardFound",
            Self::AgentMoved => "AgentMoved",
            Self::Transfer => "Transfer",
            Self::Approval => "Approval",
            Self::GenericTransfer => "GenericTransfer",
        }
    }

    /// Index of the payload field holding the location, for kinds that have one.
    ///
    /// Hazard events carry the location one slot earlier than the others.
    pub fn location_index(&self) -> Option<usize> {
        match self {
            Self::AgentSpawned | Self::TileClaimedEmpty | Self::RewardFound => Some(2),
            Self::HazardFound => Some(1),
            _ => None,
        }
    }

    /// Returns `true` if events of this kind mutate agents or claims.
    pub fn is_mutating(&self) -> bool {
        self.location_index().is_some()
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "AgentSpawned" => Self::AgentSpawned,
            "TileClaimedEmpty" => Self::TileClaimedEmpty,
            "RewardFound" => Self::RewardFound,
            "HazardFound" => Self::HazardFound,
            "AgentMoved" => Self::AgentMoved,
            "Transfer" => Self::Transfer,
            "Approval" => Self::Approval,
            "GenericTransfer" => Self::GenericTransfer,
            other => return Err(FeedError::Config(format!("unknown event kind '{other}'"))),
        })
    }
}

// ─── Selector table ───────────────────────────────────────────────────────────

/// The fixed selector → kind table. Selectors are `keccak256(name)` truncated
/// to 250 bits, rendered as 32-byte hex.
pub const EVENT_SELECTORS: &[(&str, EventKind)] = &[
    (
        "0x0236dfd41fbd75a539c04cb29b6dfe8d765a4237efacf448a6b51c825f7b6efa",
        EventKind::AgentSpawned,
    ),
    (
        "0x010803e3df88066b6485043c48915e0baf9899e1a25ca36d404878dc4010f2ea",
        EventKind::TileClaimedEmpty,
    ),
    (
        "0x01f984029a97352f9a375dfcb9d81f603632dfe2adb32c50a466d6340bec5964",
        EventKind::RewardFound,
    ),
    (
        "0x03b3fb90855eed921b70ab41f753792c9969ec5a14a316541040f47bec297d10",
        EventKind::HazardFound,
    ),
    (
        "0x01b7a4a69d165a21a71e860b967d1be4c09924260662587a284d298180c32c48",
        EventKind::AgentMoved,
    ),
    (
        "0x0099cd8bde557814842a3121e8ddfd433a539b8c9f14bf31ebf108d12e6196e9",
        EventKind::Transfer,
    ),
    (
        "0x0134692b230b9e1ffa39098904722134159652b09c5bc41d88d6698779d228ff",
        EventKind::Approval,
    ),
];

/// Compute the selector of an event name (`keccak256` masked to 250 bits).
pub fn selector(name: &str) -> String {
    let mut hasher = Keccak::v256();
    hasher.update(name.as_bytes());
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out[0] &= 0x03;
    format!("0x{}", hex::encode(out))
}

/// Canonical form of a felt-like hex string: lowercase, no `0x`, no leading zeros.
pub fn normalize_hash(hash: &str) -> String {
    let trimmed = hash.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits = digits.trim_start_matches('0').to_ascii_lowercase();
    if digits.is_empty() {
        "0".into()
    } else {
        digits
    }
}

// ─── MutationPlan ─────────────────────────────────────────────────────────────

/// The entity mutation an event implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationPlan {
    UpsertAgentSpawn {
        address: String,
        owner: String,
        origin_location: String,
    },
    ClaimEmptyIfAbsent {
        agent_address: String,
        location: String,
    },
    ClaimHazardForce {
        agent_address: String,
        location: String,
    },
    ClaimRewardForce {
        agent_address: String,
        location: String,
    },
    NoMutation,
}

impl MutationPlan {
    /// Location this plan targets, if any.
    pub fn location(&self) -> Option<&str> {
        match self {
            Self::UpsertAgentSpawn { origin_location, .. } => Some(origin_location),
            Self::ClaimEmptyIfAbsent { location, .. }
            | Self::ClaimHazardForce { location, .. }
            | Self::ClaimRewardForce { location, .. } => Some(location),
            Self::NoMutation => None,
        }
    }
}

/// Result of classifying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: EventKind,
    pub plan: MutationPlan,
}

impl Classification {
    /// A mutating kind whose payload was too short to build its plan.
    pub fn is_malformed(&self) -> bool {
        self.kind.is_mutating() && self.plan == MutationPlan::NoMutation
    }
}

// ─── EventKindTable ───────────────────────────────────────────────────────────

/// Lookup from normalized selector to [`EventKind`].
#[derive(Debug, Clone)]
pub struct EventKindTable {
    by_hash: HashMap<String, EventKind>,
}

impl Default for EventKindTable {
    fn default() -> Self {
        let by_hash = EVENT_SELECTORS
            .iter()
            .map(|(hash, kind)| (normalize_hash(hash), *kind))
            .collect();
        Self { by_hash }
    }
}

impl EventKindTable {
    /// Build the default table, then apply `selector → kind name` overrides.
    pub fn with_overrides<'a>(
        overrides: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self, FeedError> {
        let mut table = Self::default();
        for (hash, name) in overrides {
            table.by_hash.insert(normalize_hash(hash), name.parse()?);
        }
        Ok(table)
    }

    /// Kind of a selector; unmapped selectors are [`EventKind::GenericTransfer`].
    pub fn kind_of(&self, selector: &str) -> EventKind {
        self.by_hash
            .get(&normalize_hash(selector))
            .copied()
            .unwrap_or(EventKind::GenericTransfer)
    }

    /// Number of mapped selectors.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Classify an event into its kind and mutation plan.
    pub fn classify(&self, event: &RawEvent) -> Classification {
        let kind = event
            .selector()
            .map(|s| self.kind_of(s))
            .unwrap_or(EventKind::GenericTransfer);
        Classification {
            kind,
            plan: plan_for(kind, event).unwrap_or(MutationPlan::NoMutation),
        }
    }
}

fn plan_for(kind: EventKind, event: &RawEvent) -> Option<MutationPlan> {
    let location = || {
        kind.location_index()
            .and_then(|i| event.field(i))
            .map(str::to_string)
    };
    let agent = || event.field(0).map(str::to_string);

    Some(match kind {
        EventKind::AgentSpawned => MutationPlan::UpsertAgentSpawn {
            address: agent()?,
            owner: event.field(1)?.to_string(),
            origin_location: location()?,
        },
        EventKind::TileClaimedEmpty => MutationPlan::ClaimEmptyIfAbsent {
            agent_address: agent()?,
            location: location()?,
        },
        EventKind::RewardFound => MutationPlan::ClaimRewardForce {
            agent_address: agent()?,
            location: location()?,
        },
        EventKind::HazardFound => MutationPlan::ClaimHazardForce {
            agent_address: agent()?,
            location: location()?,
        },
        _ => MutationPlan::NoMutation,
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────────
