//! The `RpcTransport` trait — how JSON-RPC requests reach the ledger node.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// Sends JSON-RPC requests to a ledger node.
///
/// Implementations must be `Send + Sync` so one transport can be shared by the
/// backfill loop and the live poller.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the raw response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// The transport's endpoint, for logging.
    fn url(&self) -> &str;

    /// Call `method` and return its `result`, mapping node errors to
    /// [`TransportError::Rpc`].
    async fn call(&self, id: u64, method: &str, params: Value) -> Result<Value, TransportError> {
        let resp = self.send(JsonRpcRequest::new(id, method, params)).await?;
        resp.into_result().map_err(TransportError::Rpc)
    }
}
