//! Effective-event resolution.
//!
//! The effective view of a stream is the subset of its events that projection folds.
//! It is decided purely by sequence numbers and the rewind-marker index, never by
//! timestamps and never by scanning the raw log:
//!
//! - the latest marker `m` (by seq) keeps `1..=m.horizon` and hides everything in
//!   `m.horizon+1..m.seq`; `m` itself stays in the view for audit
//! - events appended after `m` are effective, so a rewound run can carry on
//! - the history below `m.horizon` is resolved the same way, so rewinding to `h`
//!   restores exactly the view the stream had when `h` was its head

use serde::Serialize;

use runlog_core::{AggregateId, Seq};

use crate::event_store::{EventStoreError, KvEventStore, MarkerEntry, StoredEvent};
use crate::kv::StorageError;

/// Inclusive range of effective sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub from: Seq,
    pub to: Seq,
}

impl Segment {
    pub fn contains(&self, seq: Seq) -> bool {
        self.from <= seq && seq <= self.to
    }

    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// The effective view of one stream at a given head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveSlice {
    pub aggregate_id: AggregateId,
    /// Head of the stream when the view was resolved.
    pub head: Seq,
    /// Last effective seq that is not a rewind marker; `0` when there is none.
    pub horizon: Seq,
    /// Ascending, disjoint ranges making up the view.
    pub segments: Vec<Segment>,
    /// Rewind markers that are part of the view, ascending.
    pub markers: Vec<Seq>,
}

impl EffectiveSlice {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of effective events, markers included.
    pub fn len(&self) -> u64 {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn contains(&self, seq: Seq) -> bool {
        self.segments.iter().any(|s| s.contains(seq))
    }

    pub fn is_marker(&self, seq: Seq) -> bool {
        self.markers.binary_search(&seq).is_ok()
    }

    /// Effective and not a marker: a seq whose event actually shapes state.
    pub fn is_active(&self, seq: Seq) -> bool {
        self.contains(seq) && !self.is_marker(seq)
    }

    /// Effective events with a seq greater than `seq`.
    pub fn count_after(&self, seq: Seq) -> u64 {
        self.after(seq).map(|s| s.len()).sum()
    }

    /// The view restricted to seqs greater than `seq`.
    pub fn after(&self, seq: Seq) -> impl Iterator<Item = Segment> + '_ {
        self.segments.iter().filter(move |s| s.to > seq).map(move |s| Segment {
            from: s.from.max(seq.saturating_add(1)),
            to: s.to,
        })
    }

    pub fn seqs(&self) -> impl Iterator<Item = Seq> + '_ {
        self.segments.iter().flat_map(|s| s.from..=s.to)
    }
}

/// Resolve the view for `head` from an ascending marker index.
///
/// Markers above `head` are ignored. A marker whose horizon is not below its own seq
/// can only come from a damaged index and is reported as corruption.
pub fn resolve_slice(
    aggregate_id: AggregateId,
    head: Seq,
    markers: &[MarkerEntry],
) -> Result<EffectiveSlice, StorageError> {
    let mut candidates = &markers[..markers.partition_point(|m| m.seq <= head)];
    let mut segments = Vec::new();
    let mut used = Vec::new();
    let mut upto = head;

    while upto > 0 {
        let idx = candidates.partition_point(|m| m.seq <= upto);
        let Some(marker) = idx.checked_sub(1).map(|i| candidates[i]) else {
            segments.push(Segment { from: 1, to: upto });
            break;
        };
        if marker.horizon >= marker.seq {
            return Err(StorageError::Corrupt(format!(
                "rewind marker {} of {aggregate_id} points at seq {}",
                marker.seq, marker.horizon
            )));
        }
        segments.push(Segment {
            from: marker.seq,
            to: upto,
        });
        used.push(marker.seq);
        upto = marker.horizon;
        candidates = &candidates[..idx - 1];
    }
    segments.reverse();
    used.reverse();

    let horizon = segments
        .iter()
        .rev()
        .find_map(|s| {
            let first_active = if used.binary_search(&s.from).is_ok() {
                s.from + 1
            } else {
                s.from
            };
            (first_active <= s.to).then_some(s.to)
        })
        .unwrap_or(0);

    Ok(EffectiveSlice {
        aggregate_id,
        head,
        horizon,
        segments,
        markers: used,
    })
}

/// Reads the marker index and head of a stream and exposes its effective events.
#[derive(Debug, Clone)]
pub struct EffectiveEventResolver {
    store: KvEventStore,
}

impl EffectiveEventResolver {
    pub fn new(store: KvEventStore) -> Self {
        Self { store }
    }

    pub fn effective_slice(&self, aggregate_id: AggregateId) -> Result<EffectiveSlice, EventStoreError> {
        let head = self.store.head(aggregate_id)?;
        let markers = if head == 0 {
            Vec::new()
        } else {
            self.store.markers(aggregate_id)?
        };
        Ok(resolve_slice(aggregate_id, head, &markers)?)
    }

    /// Effective events with a seq greater than `after`, in order.
    ///
    /// One range scan per remaining segment, issued lazily as iteration reaches it.
    pub fn events<'a>(
        &'a self,
        slice: &'a EffectiveSlice,
        after: Seq,
    ) -> impl Iterator<Item = Result<StoredEvent, EventStoreError>> + 'a {
        slice
            .after(after)
            .flat_map(move |s| self.store.scan_range(slice.aggregate_id, s.from, s.to))
    }
}
