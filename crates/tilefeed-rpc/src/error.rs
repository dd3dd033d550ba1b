//! Transport-level error types.

use thiserror::Error;

use tilefeed_core::FeedError;

use crate::request::JsonRpcError;

/// Errors that can occur while talking to the ledger RPC.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, non-2xx status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON-RPC error object returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Response parsed but lacked a field the protocol requires.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Returns `true` if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Timeout { .. })
    }
}

impl From<TransportError> for FeedError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Malformed(reason) => FeedError::MalformedUpstreamPayload(reason),
            TransportError::Deserialization(e) => FeedError::MalformedUpstreamPayload(e.to_string()),
            other => FeedError::SourceUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(TransportError::Http("refused".into()).is_retryable());
        assert!(TransportError::Timeout { ms: 30_000 }.is_retryable());
        assert!(!TransportError::Malformed("no events".into()).is_retryable());
    }

    #[test]
    fn maps_into_feed_taxonomy() {
        let e: FeedError = TransportError::Malformed("missing events".into()).into();
        assert!(matches!(e, FeedError::MalformedUpstreamPayload(_)));

        let e: FeedError = TransportError::Rpc(JsonRpcError {
            code: 24,
            message: "Block not found".into(),
            data: None,
        })
        .into();
        assert!(matches!(e, FeedError::SourceUnavailable(_)));
    }
}
