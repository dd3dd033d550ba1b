//! Block scanner — walks the continuation-token pagination of a block and
//! concatenates the pages.

use std::sync::Arc;

use tilefeed_core::{FeedError, RawEvent};

use crate::ledger::{BlockId, EventsPage, LedgerClient};

/// Fetches all events of a block (or one page of the pending window).
#[derive(Clone)]
pub struct BlockScanner {
    ledger: Arc<dyn LedgerClient>,
    chunk_size: u32,
}

impl BlockScanner {
    pub fn new(ledger: Arc<dyn LedgerClient>, chunk_size: u32) -> Self {
        Self {
            ledger,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Current ledger head.
    pub async fn head(&self) -> Result<u64, FeedError> {
        Ok(self.ledger.block_number().await?)
    }

    /// All events of `block`, in ledger order. An empty block is `Ok(vec![])`.
    pub async fn scan(&self, block: u64) -> Result<Vec<RawEvent>, FeedError> {
        let mut events = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.scan_page(BlockId::Number(block), token.as_deref()).await?;
            pages += 1;
            events.extend(page.events);

            match page.continuation_token {
                None => break,
                Some(next) if token.as_deref() == Some(next.as_str()) => {
                    return Err(FeedError::MalformedUpstreamPayload(format!(
                        "continuation token {next} repeated while scanning block {block}"
                    )));
                }
                Some(next) => token = Some(next),
            }
        }

        tracing::debug!(block, pages, events = events.len(), "block scanned");
        Ok(events)
    }

    /// A single page for `block`, starting at `token`.
    pub async fn scan_page(
        &self,
        block: BlockId,
        token: Option<&str>,
    ) -> Result<EventsPage, FeedError> {
        Ok(self.ledger.events_page(block, self.chunk_size, token).await?)
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }
}
