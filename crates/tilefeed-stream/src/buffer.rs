//! The shared broadcast buffer and per-subscriber backlogs.
//!
//! Both are plain FIFOs guarded by a `std::sync::Mutex` at the owner; neither
//! lock is ever held across an `.await`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tilefeed_core::BroadcastItem;

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── BroadcastBuffer ──────────────────────────────────────────────────────────

/// Capacity-capped FIFO fed by the live poller. Refuses pushes once full.
#[derive(Debug)]
pub struct BroadcastBuffer {
    items: VecDeque<BroadcastItem>,
    capacity: usize,
}

impl BroadcastBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(4_096)),
            capacity,
        }
    }

    /// Push one item, handing it back if the buffer is full.
    pub fn push(&mut self, item: BroadcastItem) -> Result<(), BroadcastItem> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Push as many `items` as fit, in order. Returns the rest.
    pub fn offer(&mut self, items: impl IntoIterator<Item = BroadcastItem>) -> Vec<BroadcastItem> {
        let mut rest = Vec::new();
        for item in items {
            if let Err(item) = self.push(item) {
                rest.push(item);
            }
        }
        rest
    }

    /// Remove up to `k` items from the front.
    pub fn drain(&mut self, k: usize) -> Vec<BroadcastItem> {
        let k = k.min(self.items.len());
        self.items.drain(..k).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.items.len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

// ─── SubscriberBacklog ────────────────────────────────────────────────────────

/// Items a subscriber missed because another subscriber drained them from the
/// shared buffer. Capped; the oldest items are evicted first.
#[derive(Debug)]
pub struct SubscriberBacklog {
    items: VecDeque<BroadcastItem>,
    cap: usize,
    evicted: u64,
}

impl SubscriberBacklog {
    pub fn new(cap: usize) -> Self {
        Self { items: VecDeque::new(), cap, evicted: 0 }
    }

    /// Append copies of `items`, evicting from the front past the cap.
    pub fn extend(&mut self, items: &[BroadcastItem]) {
        self.items.extend(items.iter().cloned());
        while self.items.len() > self.cap {
            self.items.pop_front();
            self.evicted += 1;
        }
    }

    pub fn drain(&mut self, k: usize) -> Vec<BroadcastItem> {
        let k = k.min(self.items.len());
        self.items.drain(..k).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total items dropped to stay under the cap.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(n: usize) -> BroadcastItem {
        BroadcastItem {
            event_name: "AgentMoved".into(),
            fields: vec![n.to_string()],
            timestamp: Utc::now(),
            location: None,
        }
    }

    #[test]
    fn buffer_refuses_when_full() {
        let mut buf = BroadcastBuffer::new(3);
        let rest = buf.offer((0..5).map(item));
        assert_eq!(buf.len(), 3);
        assert!(buf.is_full());
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].fields, vec!["3"]);
        assert!(buf.push(item(9)).is_err());
    }

    #[test]
    fn buffer_drains_fifo() {
        let mut buf = BroadcastBuffer::new(10);
        buf.offer((0..4).map(item));
        let out = buf.drain(3);
        assert_eq!(out.iter().map(|i| i.fields[0].as_str()).collect::<Vec<_>>(), ["0", "1", "2"]);
        assert_eq!(buf.drain(10).len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn backlog_evicts_oldest() {
        let mut backlog = SubscriberBacklog::new(3);
        let items: Vec<_> = (0..5).map(item).collect();
        backlog.extend(&items);
        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog.evicted(), 2);
        assert_eq!(backlog.drain(1)[0].fields, vec!["2"]);
    }
}
