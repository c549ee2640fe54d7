use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared by the store components.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
    pub(crate) events_replayed: AtomicU64,
    pub(crate) events_skipped: AtomicU64,
    pub(crate) snapshots_written: AtomicU64,
    pub(crate) snapshots_rejected: AtomicU64,
    pub(crate) conflicts: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn read(&self) -> HistoryStats {
        HistoryStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            events_replayed: self.events_replayed.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            snapshots_written: self.snapshots_written.load(Ordering::Relaxed),
            snapshots_rejected: self.snapshots_rejected.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Events folded during cold reconstructions
    pub events_replayed: u64,
    /// Events skipped during replay (unknown, undecodable or refused)
    pub events_skipped: u64,
    pub snapshots_written: u64,
    /// Snapshots passed over for a failed checksum or an undecodable body
    pub snapshots_rejected: u64,
    /// Appends, rewinds or branches that lost an optimistic check
    pub conflicts: u64,
}
