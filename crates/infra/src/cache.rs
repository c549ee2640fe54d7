//! Bounded LRU cache of reconstructed states.
//!
//! Entries are stamped with the head they were computed at and a lookup must present
//! the current head, so an entry can never be served for a newer stream even if an
//! invalidation raced with the insert. Writers still invalidate synchronously after
//! every successful commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use runlog_core::{AggregateId, Seq};
use runlog_pipeline::PipelineState;

struct CacheEntry {
    head: Seq,
    state: Arc<PipelineState>,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    entries: HashMap<AggregateId, CacheEntry>,
    /// Recency order: oldest tick first.
    order: BTreeMap<u64, AggregateId>,
    tick: u64,
}

impl LruState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, aggregate_id: AggregateId) -> Option<CacheEntry> {
        let entry = self.entries.remove(&aggregate_id)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }
}

pub struct StateCache {
    capacity: usize,
    state: Mutex<LruState>,
}

impl std::fmt::Debug for StateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl StateCache {
    /// A cache holding at most `capacity` states; `0` disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cached state for `aggregate_id` if it was computed at `head`.
    pub fn get(&self, aggregate_id: AggregateId, head: Seq) -> Option<Arc<PipelineState>> {
        let mut lru = self.state.lock();
        let stale = lru.entries.get(&aggregate_id)?.head != head;
        if stale {
            lru.remove(aggregate_id);
            return None;
        }

        let tick = lru.next_tick();
        let entry = lru.entries.get_mut(&aggregate_id)?;
        let previous = std::mem::replace(&mut entry.tick, tick);
        let state = entry.state.clone();
        lru.order.remove(&previous);
        lru.order.insert(tick, aggregate_id);
        Some(state)
    }

    pub fn insert(&self, aggregate_id: AggregateId, head: Seq, state: Arc<PipelineState>) {
        if self.capacity == 0 {
            return;
        }
        let mut lru = self.state.lock();
        lru.remove(aggregate_id);

        while lru.entries.len() >= self.capacity {
            let Some((_, oldest)) = lru.order.pop_first() else {
                break;
            };
            lru.entries.remove(&oldest);
        }

        let tick = lru.next_tick();
        lru.order.insert(tick, aggregate_id);
        lru.entries.insert(aggregate_id, CacheEntry { head, state, tick });
    }

    pub fn invalidate(&self, aggregate_id: AggregateId) {
        self.state.lock().remove(aggregate_id);
    }
}
