//! Ledger read interface: head block number and paginated event pages.
//!
//! The wire protocol is Starknet's `starknet_getEvents` continuation-token
//! pagination. Pages are requested for a single historic block
//! (`from = to = N`) or for the pending window.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use tilefeed_core::RawEvent;

use crate::error::TransportError;
use crate::transport::RpcTransport;

/// Which part of the chain a page request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    /// A finalized historic block.
    Number(u64),
    /// Events not yet included in a block.
    Pending,
}

impl BlockId {
    fn to_json(self) -> Value {
        match self {
            Self::Number(n) => json!({ "block_number": n }),
            Self::Pending => json!("pending"),
        }
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

/// One page of events plus the token for the next page, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsPage {
    pub events: Vec<RawEvent>,
    pub continuation_token: Option<String>,
}

/// Read-only access to the ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current head block number.
    async fn block_number(&self) -> Result<u64, TransportError>;

    /// Fetch one page of events for `block`.
    async fn events_page(
        &self,
        block: BlockId,
        chunk_size: u32,
        continuation_token: Option<&str>,
    ) -> Result<EventsPage, TransportError>;
}

// ─── Wire format ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct WireEvent {
    keys: Vec<String>,
    data: Vec<String>,
    #[serde(default)]
    block_number: Option<u64>,
    #[serde(default)]
    transaction_hash: Option<String>,
    #[serde(default)]
    from_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePage {
    #[serde(default)]
    events: Option<Vec<WireEvent>>,
    #[serde(default)]
    continuation_token: Option<String>,
}

/// Parse a `starknet_getEvents` result into an [`EventsPage`].
pub fn parse_events_page(result: Value, block: BlockId) -> Result<EventsPage, TransportError> {
    let page: WirePage = serde_json::from_value(result)?;
    let events = page
        .events
        .ok_or_else(|| TransportError::Malformed(format!("events page for block {block} has no 'events'")))?;

    let observed_at = chrono::Utc::now();
    let events = events
        .into_iter()
        .map(|e| RawEvent {
            block_number: match block {
                BlockId::Number(n) => e.block_number.or(Some(n)),
                BlockId::Pending => e.block_number,
            },
            keys: e.keys,
            fields: e.data,
            tx_hash: e.transaction_hash,
            from_address: e.from_address,
            observed_at,
        })
        .collect();

    Ok(EventsPage {
        events,
        continuation_token: page.continuation_token.filter(|t| !t.is_empty()),
    })
}

// ─── StarknetLedger ───────────────────────────────────────────────────────────

/// [`LedgerClient`] speaking the Starknet JSON-RPC API over any transport.
pub struct StarknetLedger<T> {
    transport: T,
    /// Only events emitted by this contract are requested, when set.
    contract_address: Option<String>,
    next_id: AtomicU64,
}

impl<T: RpcTransport> StarknetLedger<T> {
    pub fn new(transport: T, contract_address: Option<String>) -> Self {
        Self {
            transport,
            contract_address,
            next_id: AtomicU64::new(1),
        }
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build the `starknet_getEvents` params object.
    pub fn events_params(&self, block: BlockId, chunk_size: u32, token: Option<&str>) -> Value {
        let mut filter = json!({
            "from_block": block.to_json(),
            "to_block": block.to_json(),
            "chunk_size": chunk_size,
        });
        if let Some(address) = &self.contract_address {
            filter["address"] = json!(address);
        }
        if let Some(token) = token {
            filter["continuation_token"] = json!(token);
        }
        json!({ "filter": filter })
    }
}

#[async_trait]
impl<T: RpcTransport> LedgerClient for StarknetLedger<T> {
    async fn block_number(&self) -> Result<u64, TransportError> {
        let result = self
            .transport
            .call(self.id(), "starknet_blockNumber", json!([]))
            .await?;
        result
            .as_u64()
            .ok_or_else(|| TransportError::Malformed(format!("block number is not an integer: {result}")))
    }

    async fn events_page(
        &self,
        block: BlockId,
        chunk_size: u32,
        continuation_token: Option<&str>,
    ) -> Result<EventsPage, TransportError> {
        let params = self.events_params(block, chunk_size, continuation_token);
        let result = self
            .transport
            .call(self.id(), "starknet_getEvents", params)
            .await?;
        parse_events_page(result, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{JsonRpcRequest, JsonRpcResponse};
    use std::sync::Mutex;

    /// Transport that answers from a queue and records requests.
    struct ScriptedTransport {
        replies: Mutex<Vec<Value>>,
        seen: Mutex<Vec<JsonRpcRequest>>,
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            self.seen.lock().unwrap().push(req.clone());
            let result = self.replies.lock().unwrap().remove(0);
            Ok(JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: Some(req.id),
                result: Some(result),
                error: None,
            })
        }

        fn url(&self) -> &str {
            "scripted"
        }
    }

    fn ledger(replies: Vec<Value>) -> StarknetLedger<ScriptedTransport> {
        StarknetLedger::new(
            ScriptedTransport { replies: Mutex::new(replies), seen: Mutex::new(vec![]) },
            Some("0xgame".into()),
        )
    }

    #[test]
    fn params_for_historic_and_pending() {
        let l = ledger(vec![]);
        let p = l.events_params(BlockId::Number(42), 50, Some("7-0"));
        assert_eq!(p["filter"]["from_block"]["block_number"], 42);
        assert_eq!(p["filter"]["to_block"]["block_number"], 42);
        assert_eq!(p["filter"]["chunk_size"], 50);
        assert_eq!(p["filter"]["continuation_token"], "7-0");
        assert_eq!(p["filter"]["address"], "0xgame");

        let p = l.events_params(BlockId::Pending, 10, None);
        assert_eq!(p["filter"]["from_block"], "pending");
        assert!(p["filter"].get("continuation_token").is_none());
    }

    #[tokio::test]
    async fn parses_page_and_token() {
        let l = ledger(vec![json!({
            "events": [
                {"keys": ["0x1"], "data": ["0xa", "0xb"], "transaction_hash": "0xt"},
                {"keys": ["0x2"], "data": [], "block_number": 42}
            ],
            "continuation_token": "42-2"
        })]);
        let page = l.events_page(BlockId::Number(42), 2, None).await.unwrap();
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].block_number, Some(42));
        assert_eq!(page.events[0].fields, vec!["0xa", "0xb"]);
        assert_eq!(page.events[0].tx_hash.as_deref(), Some("0xt"));
        assert_eq!(page.continuation_token.as_deref(), Some("42-2"));
    }

    #[tokio::test]
    async fn pending_events_have_no_block() {
        let l = ledger(vec![json!({ "events": [{"keys": ["0x1"], "data": []}] })]);
        let page = l.events_page(BlockId::Pending, 10, None).await.unwrap();
        assert!(page.events[0].is_pending());
        assert!(page.continuation_token.is_none());
    }

    #[tokio::test]
    async fn missing_events_is_malformed() {
        let l = ledger(vec![json!({ "continuation_token": "x" })]);
        let err = l.events_page(BlockId::Number(1), 10, None).await.unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[tokio::test]
    async fn block_number() {
        let l = ledger(vec![json!(812_345)]);
        assert_eq!(l.block_number().await.unwrap(), 812_345);
        let seen = l.transport.seen.lock().unwrap();
        assert_eq!(seen[0].method, "starknet_blockNumber");
    }
}
