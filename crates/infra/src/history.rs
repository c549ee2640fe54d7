//! `HistoryStore`: the facade tying the log, resolver, projector, snapshots, branches
//! and cache together.
//!
//! Write path: validate → compare-and-append → refresh the cache entry → publish the committed
//! envelope. Read path: resolve the effective view → cache (stamped with the head) →
//! newest valid snapshot → fold the remaining effective events.
//!
//! Publication happens only after the commit succeeded and never fails the write; the
//! snapshot worker listening on the bus re-reads the log, so a lost notification only
//! delays a snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

use runlog_core::{AggregateId, Seq};
use runlog_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
use runlog_pipeline::{PipelineEvent, PipelineState, Replay, apply};

use crate::branch::{BranchEdge, BranchManager, RewindAck};
use crate::cache::StateCache;
use crate::config::HistoryConfig;
use crate::error::HistoryError;
use crate::event_store::{EventScan, EventStoreError, KvEventStore, ScanObserver, StoredEvent, UncommittedEvent};
use crate::kv::{KvEngine, StorageError};
use crate::resolver::{EffectiveEventResolver, EffectiveSlice};
use crate::snapshot::{Snapshot, SnapshotManager, SnapshotWorker, WorkerHandle};
use crate::stats::{Counters, HistoryStats};

/// Commit notifications: every committed envelope, in commit order per aggregate.
pub type CommitBus = InMemoryEventBus<EventEnvelope<JsonValue>>;

/// Cooperative cancellation for cold replays, checked between events.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct HistoryStoreBuilder {
    kv: Arc<dyn KvEngine>,
    config: HistoryConfig,
    bus: Option<Arc<CommitBus>>,
    scan_observer: Option<ScanObserver>,
}

impl HistoryStoreBuilder {
    pub fn new(kv: Arc<dyn KvEngine>) -> Self {
        Self {
            kv,
            config: HistoryConfig::default(),
            bus: None,
            scan_observer: None,
        }
    }

    pub fn config(mut self, config: HistoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a commit bus with other consumers instead of creating a private one.
    pub fn bus(mut self, bus: Arc<CommitBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Observe every event range the store scans.
    pub fn scan_observer(mut self, observer: ScanObserver) -> Self {
        self.scan_observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<HistoryStore, HistoryError> {
        self.config.validate()?;

        let mut store = KvEventStore::new(self.kv.clone()).with_page_size(self.config.scan_page_size);
        if let Some(observer) = self.scan_observer {
            store = store.with_scan_observer(observer);
        }
        let counters = Arc::new(Counters::default());

        let inner = Arc::new(Inner {
            resolver: EffectiveEventResolver::new(store.clone()),
            snapshots: SnapshotManager::new(
                self.kv,
                self.config.snapshot,
                self.config.scan_page_size,
                counters.clone(),
            ),
            branches: BranchManager::new(store.clone(), self.config.max_conflict_retries, counters.clone()),
            cache: StateCache::new(self.config.cache_capacity),
            bus: self.bus.unwrap_or_default(),
            store,
            counters,
        });

        let worker = if self.config.background_snapshots {
            let target = inner.clone();
            let handle = SnapshotWorker::spawn("runlog-snapshots", &inner.bus, move |event: StoredEvent| {
                target.snapshot_if_due(event.aggregate_id())
            })
            .map_err(|e| StorageError::Unavailable(format!("cannot start snapshot worker: {e}")))?;
            Some(handle)
        } else {
            None
        };

        Ok(HistoryStore {
            inner,
            config: self.config,
            worker,
        })
    }
}

struct Inner {
    store: KvEventStore,
    resolver: EffectiveEventResolver,
    snapshots: SnapshotManager,
    branches: BranchManager,
    cache: StateCache,
    bus: Arc<CommitBus>,
    counters: Arc<Counters>,
}

impl Inner {
    /// State at the current head together with the view it was folded from.
    fn load(
        &self,
        aggregate_id: AggregateId,
        cancel: &CancelToken,
    ) -> Result<(Option<Arc<PipelineState>>, EffectiveSlice), HistoryError> {
        let slice = self.resolver.effective_slice(aggregate_id)?;
        if slice.head == 0 {
            return Ok((None, slice));
        }
        if let Some(state) = self.cache.get(aggregate_id, slice.head) {
            Counters::bump(&self.counters.cache_hits);
            return Ok((Some(state), slice));
        }
        Counters::bump(&self.counters.cache_misses);

        let mut replay = match self.snapshots.load_latest_valid(&slice)? {
            Some(snapshot) => Replay::from_baseline(aggregate_id, snapshot.state, snapshot.through_seq),
            None => Replay::new(aggregate_id),
        };
        let baseline_seq = replay.report().last_seq;

        for event in self.resolver.events(&slice, baseline_seq) {
            if cancel.is_cancelled() {
                debug!(aggregate_id = %aggregate_id, "replay cancelled");
                return Err(HistoryError::Cancelled);
            }
            replay.feed(&event?);
        }
        if cancel.is_cancelled() {
            return Err(HistoryError::Cancelled);
        }

        let (state, report) = replay.finish();
        Counters::add(&self.counters.events_replayed, report.applied);
        Counters::add(&self.counters.events_skipped, report.skipped());
        debug!(
            aggregate_id = %aggregate_id,
            head = slice.head,
            baseline_seq,
            applied = report.applied,
            skipped = report.skipped(),
            "state reconstructed"
        );

        let state = state.map(Arc::new);
        if let Some(state) = &state {
            self.cache.insert(aggregate_id, slice.head, state.clone());
        }
        Ok((state, slice))
    }

    fn snapshot_at_horizon(&self, aggregate_id: AggregateId) -> Result<Snapshot, HistoryError> {
        let (state, slice) = self.load(aggregate_id, &CancelToken::new())?;
        let state = state.ok_or(HistoryError::NotFound(aggregate_id))?;
        // Trailing markers after the horizon do not change state.
        Ok(self.snapshots.snapshot(&state, slice.horizon)?)
    }

    fn snapshot_if_due(&self, aggregate_id: AggregateId) -> Result<(), HistoryError> {
        let slice = self.resolver.effective_slice(aggregate_id)?;
        if slice.horizon == 0 || !self.snapshots.should_snapshot(&slice)? {
            return Ok(());
        }
        self.snapshot_at_horizon(aggregate_id).map(|_| ())
    }

    fn publish(&self, events: &[StoredEvent]) {
        for event in events {
            if let Err(err) = self.bus.publish(event.clone()) {
                warn!(
                    aggregate_id = %event.aggregate_id(),
                    seq = event.sequence_number(),
                    error = ?err,
                    "commit notification dropped"
                );
            }
        }
    }
}

/// Event-sourced history of pipeline runs.
///
/// Cheap to share behind an `Arc`; all operations take `&self`. Dropping the store
/// stops its background snapshot worker.
pub struct HistoryStore {
    inner: Arc<Inner>,
    config: HistoryConfig,
    worker: Option<WorkerHandle>,
}

impl HistoryStore {
    pub fn builder(kv: Arc<dyn KvEngine>) -> HistoryStoreBuilder {
        HistoryStoreBuilder::new(kv)
    }

    /// Store with the default configuration.
    pub fn open(kv: Arc<dyn KvEngine>) -> Result<Self, HistoryError> {
        Self::builder(kv).build()
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Current state of a run or branch.
    pub fn reconstruct(&self, aggregate_id: AggregateId) -> Result<Arc<PipelineState>, HistoryError> {
        self.reconstruct_cancellable(aggregate_id, &CancelToken::new())
    }

    /// Like [`HistoryStore::reconstruct`]; a cold replay stops with
    /// [`HistoryError::Cancelled`] once `cancel` is set. Nothing is persisted either way.
    pub fn reconstruct_cancellable(
        &self,
        aggregate_id: AggregateId,
        cancel: &CancelToken,
    ) -> Result<Arc<PipelineState>, HistoryError> {
        let (state, _) = self.inner.load(aggregate_id, cancel)?;
        state.ok_or(HistoryError::NotFound(aggregate_id))
    }

    /// Append one event after `expected_seq` and return its seq.
    ///
    /// The event must be valid against the current state (a second `PipelineStarted`
    /// fails with [`HistoryError::AlreadyStarted`]). Rewind markers and branch events
    /// are written only by [`HistoryStore::rewind`] and [`HistoryStore::create_branch`].
    pub fn append_event(
        &self,
        aggregate_id: AggregateId,
        expected_seq: Seq,
        event: PipelineEvent,
    ) -> Result<Seq, HistoryError> {
        if event.is_reserved() {
            return Err(HistoryError::InvalidEvent(format!(
                "{} events are written by the store itself",
                runlog_events::Event::event_type(&event)
            )));
        }

        let (current, slice) = self.inner.load(aggregate_id, &CancelToken::new())?;
        if slice.head != expected_seq {
            Counters::bump(&self.inner.counters.conflicts);
            return Err(HistoryError::ConcurrentAppendConflict {
                aggregate_id,
                expected: expected_seq,
                actual: slice.head,
            });
        }
        let next = apply(current.as_deref(), aggregate_id, expected_seq + 1, &event)
            .map_err(|e| HistoryError::domain(aggregate_id, e))?;

        let uncommitted = UncommittedEvent::from_typed(Uuid::now_v7(), &event)?;
        let committed = self
            .inner
            .store
            .append(aggregate_id, expected_seq, vec![uncommitted])
            .inspect_err(|e| {
                if matches!(e, EventStoreError::Concurrency { .. }) {
                    Counters::bump(&self.inner.counters.conflicts);
                }
            })?;
        let head = expected_seq + committed.len() as Seq;
        self.inner.cache.invalidate(aggregate_id);
        // The trial-applied state is exactly the fold at the new head.
        if let Some(next) = next {
            self.inner.cache.insert(aggregate_id, head, Arc::new(next));
        }
        self.inner.publish(&committed);

        Ok(head)
    }

    /// Fork `parent_id` at `branch_point_seq` and return the new branch's id.
    pub fn create_branch(
        &self,
        parent_id: AggregateId,
        branch_point_seq: Seq,
        name: &str,
    ) -> Result<AggregateId, HistoryError> {
        let (edge, event) = self.inner.branches.create_branch(parent_id, branch_point_seq, name)?;
        self.inner.cache.invalidate(edge.child_id);
        self.inner.publish(std::slice::from_ref(&event));
        Ok(edge.child_id)
    }

    /// Rewind `aggregate_id` to the step boundary at `target_seq`.
    pub fn rewind(&self, aggregate_id: AggregateId, target_seq: Seq) -> Result<RewindAck, HistoryError> {
        let (ack, event) = self.inner.branches.rewind(aggregate_id, target_seq)?;
        self.inner.cache.invalidate(aggregate_id);
        self.inner.publish(std::slice::from_ref(&event));
        Ok(ack)
    }

    pub fn get_branch_tree(
        &self,
        root_id: AggregateId,
    ) -> Result<BTreeMap<AggregateId, Vec<AggregateId>>, HistoryError> {
        Ok(self.inner.branches.index().tree(root_id)?)
    }

    pub fn parent_of(&self, child_id: AggregateId) -> Result<Option<BranchEdge>, HistoryError> {
        Ok(self.inner.branches.index().parent_of(child_id)?)
    }

    /// The raw log from `from_seq` on, rewound-away events and markers included.
    pub fn scan(&self, aggregate_id: AggregateId, from_seq: Seq) -> EventScan<'_> {
        self.inner.store.scan(aggregate_id, from_seq)
    }

    pub fn head(&self, aggregate_id: AggregateId) -> Result<Seq, HistoryError> {
        Ok(self.inner.store.head(aggregate_id)?)
    }

    pub fn effective_slice(&self, aggregate_id: AggregateId) -> Result<EffectiveSlice, HistoryError> {
        Ok(self.inner.resolver.effective_slice(aggregate_id)?)
    }

    /// Whether the snapshot policy asks for a new snapshot of `aggregate_id`.
    pub fn should_snapshot(&self, aggregate_id: AggregateId) -> Result<bool, HistoryError> {
        let slice = self.inner.resolver.effective_slice(aggregate_id)?;
        Ok(slice.horizon > 0 && self.inner.snapshots.should_snapshot(&slice)?)
    }

    /// Snapshot the current state synchronously, at the last active seq.
    pub fn snapshot_now(&self, aggregate_id: AggregateId) -> Result<Snapshot, HistoryError> {
        self.inner.snapshot_at_horizon(aggregate_id)
    }

    /// Commit notifications published after this call.
    ///
    /// The subscription queues at most [`runlog_events::DEFAULT_SUBSCRIBER_CAPACITY`]
    /// unread envelopes; later ones are dropped for it until it catches up. Dropping
    /// the subscription detaches it.
    pub fn subscribe(&self) -> Subscription<StoredEvent> {
        self.inner.bus.subscribe()
    }

    pub fn stats(&self) -> HistoryStats {
        self.inner.counters.read()
    }
}

impl Drop for HistoryStore {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}
