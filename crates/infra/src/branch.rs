//! Copy-on-write branches, non-destructive rewind and the branch edge index.
//!
//! A branch is materialized by copying the parent's raw events `1..=branch_point`
//! (marker-index entries included) into a fresh stream and appending
//! `PipelineBranched` on top, all in the transaction that also records the edge.
//! After that the two streams share nothing.
//!
//! Edges are indexed both ways: `br/up/{child}` answers "who is my parent" with one
//! read, `br/down/{parent}/{child}` lists children with one prefix scan.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use runlog_core::{AggregateId, Seq};
use runlog_pipeline::{PipelineBranched, PipelineEvent, RewindMarker, STEP_BOUNDARY_TYPES};

use crate::error::HistoryError;
use crate::event_store::{EventStoreError, KvEventStore, StoredEvent, UncommittedEvent, read_head};
use crate::keys;
use crate::kv::{KvEngine, StorageError, WriteTxn};
use crate::resolver::{EffectiveEventResolver, EffectiveSlice};
use crate::stats::Counters;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchEdge {
    pub parent_id: AggregateId,
    pub child_id: AggregateId,
    pub branch_point_seq: Seq,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Acknowledgement of a committed rewind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RewindAck {
    pub aggregate_id: AggregateId,
    /// Seq of the appended marker.
    pub marker_seq: Seq,
    /// Seq the marker rewound to.
    pub horizon_seq: Seq,
}

/// Parent/children lookups over the edge keys.
#[derive(Clone)]
pub struct BranchIndex {
    kv: Arc<dyn KvEngine>,
    page_size: usize,
}

impl BranchIndex {
    pub fn new(kv: Arc<dyn KvEngine>, page_size: usize) -> Self {
        Self {
            kv,
            page_size: page_size.max(1),
        }
    }

    pub fn parent_of(&self, child_id: AggregateId) -> Result<Option<BranchEdge>, StorageError> {
        let key = keys::parent_edge(child_id);
        self.kv.get(&key)?.map(|bytes| decode_edge(&key, &bytes)).transpose()
    }

    /// Direct children of `parent_id`, oldest first.
    pub fn children(&self, parent_id: AggregateId) -> Result<Vec<BranchEdge>, StorageError> {
        let end = keys::prefix_end(&keys::children_prefix(parent_id));
        let mut start = keys::children_prefix(parent_id);
        let mut edges = Vec::new();

        loop {
            let page = self.kv.scan(&start, &end, self.page_size)?;
            let full = page.len() == self.page_size;
            for (key, bytes) in &page {
                edges.push(decode_edge(key, bytes)?);
            }
            match page.last() {
                // Smallest key strictly greater than the last one seen.
                Some((key, _)) if full => start = format!("{key}\u{0}"),
                _ => break,
            }
        }
        Ok(edges)
    }

    /// Every node reachable from `root_id`, mapped to its direct children
    /// (leaves map to an empty list).
    pub fn tree(&self, root_id: AggregateId) -> Result<BTreeMap<AggregateId, Vec<AggregateId>>, StorageError> {
        let mut tree = BTreeMap::new();
        let mut seen = HashSet::from([root_id]);
        let mut queue = VecDeque::from([root_id]);

        while let Some(node) = queue.pop_front() {
            let children: Vec<AggregateId> = self.children(node)?.into_iter().map(|e| e.child_id).collect();
            for child in &children {
                if seen.insert(*child) {
                    queue.push_back(*child);
                }
            }
            tree.insert(node, children);
        }
        Ok(tree)
    }

    fn stage(&self, txn: &mut dyn WriteTxn, edge: &BranchEdge) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(edge)?;
        txn.put(keys::parent_edge(edge.child_id), bytes.clone());
        txn.put(keys::child_edge(edge.parent_id, edge.child_id), bytes);
        Ok(())
    }
}

fn decode_edge(key: &str, bytes: &[u8]) -> Result<BranchEdge, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt(format!("edge at '{key}': {e}")))
}

/// Creates branches and rewinds streams, retrying optimistic conflicts a bounded
/// number of times.
#[derive(Clone)]
pub struct BranchManager {
    store: KvEventStore,
    resolver: EffectiveEventResolver,
    index: BranchIndex,
    max_retries: u32,
    counters: Arc<Counters>,
}

impl BranchManager {
    pub(crate) fn new(store: KvEventStore, max_retries: u32, counters: Arc<Counters>) -> Self {
        Self {
            resolver: EffectiveEventResolver::new(store.clone()),
            index: BranchIndex::new(store.kv().clone(), store.page_size()),
            store,
            max_retries,
            counters,
        }
    }

    pub fn index(&self) -> &BranchIndex {
        &self.index
    }

    /// Fork `parent_id` at `branch_point_seq`, which must be an active effective seq.
    ///
    /// Returns the new edge and the child's committed `PipelineBranched` event.
    pub fn create_branch(
        &self,
        parent_id: AggregateId,
        branch_point_seq: Seq,
        name: &str,
    ) -> Result<(BranchEdge, StoredEvent), HistoryError> {
        if name.trim().is_empty() {
            return Err(HistoryError::InvalidEvent("branch name cannot be empty".to_string()));
        }

        let mut attempt = 0;
        loop {
            let slice = self.resolver.effective_slice(parent_id)?;
            if slice.head == 0 {
                return Err(HistoryError::NotFound(parent_id));
            }
            if !slice.is_active(branch_point_seq) {
                return Err(HistoryError::InvalidBranchPoint {
                    aggregate_id: parent_id,
                    seq: branch_point_seq,
                    horizon: slice.horizon,
                });
            }

            match self.try_branch(&slice, branch_point_seq, name) {
                Err(HistoryError::ConcurrentAppendConflict { actual, .. }) if attempt < self.max_retries => {
                    attempt += 1;
                    Counters::bump(&self.counters.conflicts);
                    warn!(
                        aggregate_id = %parent_id,
                        expected = slice.head,
                        actual,
                        attempt,
                        "parent moved while branching, retrying"
                    );
                }
                other => return other,
            }
        }
    }

    fn try_branch(
        &self,
        slice: &EffectiveSlice,
        branch_point_seq: Seq,
        name: &str,
    ) -> Result<(BranchEdge, StoredEvent), HistoryError> {
        let parent_id = slice.aggregate_id;
        let child_id = AggregateId::new();
        let created_at = Utc::now();

        let mut txn = self.store.kv().begin_write()?;
        let observed = read_head(parent_id, txn.get(&keys::head(parent_id))?)?;
        if observed != slice.head {
            return Err(HistoryError::ConcurrentAppendConflict {
                aggregate_id: parent_id,
                expected: slice.head,
                actual: observed,
            });
        }

        self.store.stage_copy_prefix(&mut *txn, parent_id, child_id, branch_point_seq)?;

        let branched = PipelineEvent::PipelineBranched(PipelineBranched {
            parent_id,
            branch_point_seq,
            name: name.to_string(),
            occurred_at: created_at,
        });
        let mut committed = self.store.stage_append(
            &mut *txn,
            child_id,
            branch_point_seq,
            vec![UncommittedEvent::from_typed(Uuid::now_v7(), &branched)?],
        )?;

        let edge = BranchEdge {
            parent_id,
            child_id,
            branch_point_seq,
            name: name.to_string(),
            created_at,
        };
        self.index.stage(&mut *txn, &edge)?;
        txn.commit()?;

        info!(
            parent_id = %parent_id,
            child_id = %child_id,
            branch_point_seq,
            name,
            "branch created"
        );
        let event = committed
            .pop()
            .ok_or_else(|| StorageError::Corrupt("branch event missing after commit".to_string()))?;
        Ok((edge, event))
    }

    /// Append a rewind marker making `target_seq` the new horizon.
    ///
    /// The target must be a step boundary (`PipelineStarted` or `StepCompleted`) with
    /// `1 <= target_seq <= head`. Nothing is removed: the rewound-away events stay in
    /// the log and a later rewind can bring them back.
    pub fn rewind(&self, aggregate_id: AggregateId, target_seq: Seq) -> Result<(RewindAck, StoredEvent), HistoryError> {
        let mut attempt = 0;
        loop {
            let head = self.store.head(aggregate_id)?;
            if head == 0 {
                return Err(HistoryError::NotFound(aggregate_id));
            }
            self.check_rewind_target(aggregate_id, target_seq, head)?;

            let marker = PipelineEvent::RewindMarker(RewindMarker {
                horizon_seq: target_seq,
                occurred_at: Utc::now(),
            });
            let uncommitted = UncommittedEvent::from_typed(Uuid::now_v7(), &marker)?;

            match self.store.append(aggregate_id, head, vec![uncommitted]) {
                Ok(mut committed) => {
                    let event = committed
                        .pop()
                        .ok_or_else(|| StorageError::Corrupt("rewind marker missing after commit".to_string()))?;
                    let ack = RewindAck {
                        aggregate_id,
                        marker_seq: event.sequence_number(),
                        horizon_seq: target_seq,
                    };
                    info!(
                        aggregate_id = %aggregate_id,
                        marker_seq = ack.marker_seq,
                        horizon = target_seq,
                        "stream rewound"
                    );
                    return Ok((ack, event));
                }
                Err(EventStoreError::Concurrency { actual, .. }) if attempt < self.max_retries => {
                    attempt += 1;
                    Counters::bump(&self.counters.conflicts);
                    warn!(
                        aggregate_id = %aggregate_id,
                        expected = head,
                        actual,
                        attempt,
                        "head moved while rewinding, retrying"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn check_rewind_target(&self, aggregate_id: AggregateId, target_seq: Seq, head: Seq) -> Result<(), HistoryError> {
        let invalid = |reason: String| HistoryError::InvalidRewindTarget {
            aggregate_id,
            seq: target_seq,
            reason,
        };

        if target_seq == 0 || target_seq > head {
            return Err(invalid(format!("outside 1..={head}")));
        }
        let event = self.store.get(aggregate_id, target_seq)?.ok_or_else(|| {
            StorageError::Corrupt(format!("{aggregate_id} has no event at seq {target_seq} below head {head}"))
        })?;
        if !STEP_BOUNDARY_TYPES.contains(&event.event_type()) {
            return Err(invalid(format!("{} is not a step boundary", event.event_type())));
        }
        Ok(())
    }
}
