//! Error types shared by the ingestion and fan-out pipelines.

use thiserror::Error;

/// Errors that can occur while ingesting or re-publishing ledger events.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The ledger RPC could not be reached or answered with an error.
    #[error("Ledger source unavailable: {0}")]
    SourceUnavailable(String),

    /// The ledger answered, but the payload lacked the expected fields.
    #[error("Malformed upstream payload: {0}")]
    MalformedUpstreamPayload(String),

    /// A batch write against one entity collection failed.
    #[error("Store write failed for '{collection}': {reason}")]
    StoreWriteFailure { collection: String, reason: String },

    /// Delivering a batch to a live subscriber failed.
    #[error("Send to subscriber {subscriber} failed: {reason}")]
    SubscriberSendFailure { subscriber: u64, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl FeedError {
    /// Returns `true` if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_) | Self::StoreWriteFailure { .. } | Self::Storage(_)
        )
    }

    /// Shorthand for a [`FeedError::StoreWriteFailure`].
    pub fn store_write(collection: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::StoreWriteFailure {
            collection: collection.to_string(),
            reason: reason.into(),
        }
    }
}
