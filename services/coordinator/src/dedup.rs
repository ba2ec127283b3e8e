//! Time-windowed duplicate suppression keyed by opportunity id.
//!
//! Ids are held in an [`LruCache`] sized to `max_entries` and kept in
//! first-seen order: a duplicate is answered with `peek`, so only a fresh
//! (or re-windowed) sighting moves an id to the front. The cache is therefore
//! bounded on every insert, evicting the oldest sighting, and `sweep` only
//! has to pop expired ids off the tail.
//!
//! The check and the insert happen under one lock, so two tasks racing on the
//! same id see exactly one [`DedupOutcome::First`].

use collections::LruCache;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::debug;
use types::OpportunityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// Not seen within the window; now recorded
    First,
    Duplicate,
}

#[derive(Debug)]
pub struct DedupCache {
    /// id → first seen (ms since epoch)
    seen: Mutex<LruCache<OpportunityId, u64>>,
    window_ms: u64,
    max_entries: usize,
}

impl DedupCache {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            seen: Mutex::new(LruCache::new(max_entries)),
            window_ms: window.as_millis() as u64,
            max_entries,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Record `id` at `now_ms` unless it was first seen within the window
    pub fn check_and_insert(&self, id: &OpportunityId, now_ms: u64) -> DedupOutcome {
        let mut seen = self.seen.lock();
        if let Some(first) = seen.peek(id) {
            if now_ms.saturating_sub(*first) <= self.window_ms {
                return DedupOutcome::Duplicate;
            }
        }
        if let Some((evicted, first)) = seen.insert(id.clone(), now_ms) {
            if &evicted != id {
                debug!(id = %evicted, first_seen = first, "Dedup entry evicted at capacity");
            }
        }
        DedupOutcome::First
    }

    /// Note `id` as seen without asking; an entry still inside its window keeps its time
    pub fn record(&self, id: &OpportunityId, now_ms: u64) {
        let _ = self.check_and_insert(id, now_ms);
    }

    /// Forget `id`, so the next sighting counts as the first
    pub fn forget(&self, id: &OpportunityId) -> bool {
        self.seen.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &OpportunityId, now_ms: u64) -> bool {
        self.seen
            .lock()
            .peek(id)
            .is_some_and(|first| now_ms.saturating_sub(*first) <= self.window_ms)
    }

    /// Drop entries older than the window, oldest first.
    ///
    /// Returns how many entries were removed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let mut seen = self.seen.lock();
        let mut removed = 0;
        while let Some((_, first)) = seen.peek_lru() {
            if now_ms.saturating_sub(*first) <= self.window_ms {
                break;
            }
            seen.pop_lru();
            removed += 1;
        }

        if removed > 0 {
            debug!(removed, remaining = seen.len(), "Dedup sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}
