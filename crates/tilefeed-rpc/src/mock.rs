//! In-memory [`LedgerClient`] for tests and local demos.
//!
//! Continuation tokens are plain offsets into the block's event list. Pending
//! events stay in the window until [`MockLedger::clear_pending`] is called, so
//! repeated polls observe them again, as a real node does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use tilefeed_core::RawEvent;

use crate::error::TransportError;
use crate::ledger::{BlockId, EventsPage, LedgerClient};
use crate::request::JsonRpcError;

#[derive(Default)]
struct Inner {
    head: u64,
    blocks: HashMap<u64, Vec<RawEvent>>,
    pending: Vec<RawEvent>,
    fail_next: usize,
    malformed_next: usize,
}

/// Scripted ledger.
#[derive(Default)]
pub struct MockLedger {
    inner: Mutex<Inner>,
    head_calls: AtomicUsize,
    page_calls: AtomicUsize,
}

impl MockLedger {
    pub fn new(head: u64) -> Self {
        let ledger = Self::default();
        ledger.set_head(head);
        ledger
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn set_head(&self, head: u64) {
        self.with(|i| i.head = head);
    }

    /// Replace the events of a historic block.
    pub fn set_block(&self, block: u64, events: Vec<RawEvent>) {
        self.with(|i| {
            i.blocks.insert(block, events);
        });
    }

    /// Append events to the pending window.
    pub fn push_pending(&self, events: Vec<RawEvent>) {
        self.with(|i| i.pending.extend(events));
    }

    /// Drop every pending event (they "finalized").
    pub fn clear_pending(&self) {
        self.with(|i| i.pending.clear());
    }

    /// Fail the next `n` calls with a retryable HTTP error.
    pub fn fail_next(&self, n: usize) {
        self.with(|i| i.fail_next = n);
    }

    /// Answer the next `n` page requests without an `events` field.
    pub fn malformed_next(&self, n: usize) {
        self.with(|i| i.malformed_next = n);
    }

    pub fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    fn take_failure(inner: &mut Inner) -> Result<(), TransportError> {
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(TransportError::Http("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn block_number(&self) -> Result<u64, TransportError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        self.with(|i| {
            Self::take_failure(i)?;
            Ok(i.head)
        })
    }

    async fn events_page(
        &self,
        block: BlockId,
        chunk_size: u32,
        continuation_token: Option<&str>,
    ) -> Result<EventsPage, TransportError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        self.with(|i| {
            Self::take_failure(i)?;
            if i.malformed_next > 0 {
                i.malformed_next -= 1;
                return Err(TransportError::Malformed(format!(
                    "events page for block {block} has no 'events'"
                )));
            }

            let offset = match continuation_token {
                None => 0,
                Some(t) => t.parse::<usize>().map_err(|_| {
                    TransportError::Rpc(JsonRpcError {
                        code: 33,
                        message: "The supplied continuation token is invalid or unknown".into(),
                        data: None,
                    })
                })?,
            };

            let source: &[RawEvent] = match block {
                BlockId::Number(n) => i.blocks.get(&n).map(Vec::as_slice).unwrap_or(&[]),
                BlockId::Pending => &i.pending,
            };
            let end = (offset + chunk_size.max(1) as usize).min(source.len());
            let events = source.get(offset..end).map(<[RawEvent]>::to_vec).unwrap_or_default();
            let continuation_token = (end < source.len()).then(|| end.to_string());

            Ok(EventsPage { events, continuation_token })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pages_by_offset() {
        let ledger = MockLedger::new(1);
        ledger.push_pending((0..5).map(|n| RawEvent::new(None, vec![], vec![n.to_string()])).collect());

        let first = ledger.events_page(BlockId::Pending, 2, None).await.unwrap();
        assert_eq!(first.events.len(), 2);
        assert_eq!(first.continuation_token.as_deref(), Some("2"));

        let last = ledger.events_page(BlockId::Pending, 2, Some("4")).await.unwrap();
        assert_eq!(last.events.len(), 1);
        assert!(last.continuation_token.is_none());
    }

    #[tokio::test]
    async fn bad_token_is_rpc_error() {
        let ledger = MockLedger::new(1);
        let err = ledger.events_page(BlockId::Pending, 2, Some("zz")).await.unwrap_err();
        assert!(matches!(err, TransportError::Rpc(ref e) if e.code == 33));
    }
}
