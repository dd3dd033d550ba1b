//! tilefeed-rpc — ledger access for ingestion and the live poller.
//!
//! Layers, bottom up:
//!
//! - [`RpcTransport`]: sends JSON-RPC 2.0 requests ([`HttpRpcClient`] over
//!   `reqwest`, with [`RetryPolicy`] backoff).
//! - [`LedgerClient`]: head block number and one page of events
//!   ([`StarknetLedger`] over any transport, [`MockLedger`] in memory).
//! - [`BlockScanner`]: follows continuation tokens until a block is complete.

pub mod error;
pub mod http;
pub mod ledger;
pub mod mock;
pub mod policy;
pub mod request;
pub mod scanner;
pub mod transport;

pub use error::TransportError;
pub use http::{HttpClientConfig, HttpRpcClient};
pub use ledger::{BlockId, EventsPage, LedgerClient, StarknetLedger};
pub use mock::MockLedger;
pub use policy::{RetryConfig, RetryPolicy};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use scanner::BlockScanner;
pub use transport::RpcTransport;
