use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use runlog_core::{AggregateId, Seq};
use runlog_events::EventEnvelope;
use runlog_pipeline::PipelineEvent;
use runlog_pipeline::event::REWIND_MARKER;

use super::types::{EventStoreError, MarkerEntry, ScanRange, StoredEvent, UncommittedEvent};
use crate::keys;
use crate::kv::{KvEngine, StorageError, WriteTxn};

const DEFAULT_PAGE_SIZE: usize = 256;

/// Callback receiving every range requested through [`KvEventStore::scan_range`].
pub type ScanObserver = Arc<dyn Fn(&ScanRange) + Send + Sync>;

/// Event log persisted in a [`KvEngine`].
///
/// Each append writes, in one transaction, the event records, the new head and (for
/// rewind markers) the marker-index entry, so readers never see one without the others.
#[derive(Clone)]
pub struct KvEventStore {
    kv: Arc<dyn KvEngine>,
    page_size: usize,
    observer: Option<ScanObserver>,
}

impl fmt::Debug for KvEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvEventStore")
            .field("page_size", &self.page_size)
            .field("observed", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl KvEventStore {
    pub fn new(kv: Arc<dyn KvEngine>) -> Self {
        Self {
            kv,
            page_size: DEFAULT_PAGE_SIZE,
            observer: None,
        }
    }

    /// Number of events fetched per KV round trip while scanning.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_scan_observer(mut self, observer: ScanObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn kv(&self) -> &Arc<dyn KvEngine> {
        &self.kv
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Sequence number of the last appended event; `0` for an unknown aggregate.
    pub fn head(&self, aggregate_id: AggregateId) -> Result<Seq, EventStoreError> {
        Ok(read_head(aggregate_id, self.kv.get(&keys::head(aggregate_id))?)?)
    }

    pub fn get(&self, aggregate_id: AggregateId, seq: Seq) -> Result<Option<StoredEvent>, EventStoreError> {
        let key = keys::event(aggregate_id, seq);
        match self.kv.get(&key)? {
            Some(bytes) => Ok(Some(decode_event(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Append events after `expected_seq`.
    ///
    /// Fails with [`EventStoreError::Concurrency`] (writing nothing) unless the stored
    /// head equals `expected_seq`. Returns the events as committed.
    pub fn append(
        &self,
        aggregate_id: AggregateId,
        expected_seq: Seq,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut txn = self.kv.begin_write()?;
        let committed = self.stage_append(&mut *txn, aggregate_id, expected_seq, events)?;
        txn.commit()?;

        debug!(
            aggregate_id = %aggregate_id,
            first_seq = expected_seq + 1,
            last_seq = expected_seq + committed.len() as Seq,
            "appended events"
        );
        Ok(committed)
    }

    /// Every event from `from_seq` onwards.
    pub fn scan(&self, aggregate_id: AggregateId, from_seq: Seq) -> EventScan<'_> {
        self.scan_range(aggregate_id, from_seq, Seq::MAX)
    }

    /// Events `from..=to` in order, fetched lazily one page at a time.
    ///
    /// A range reaching past the head simply ends early. A hole inside the stream is
    /// reported as [`StorageError::Corrupt`] and ends the iteration.
    pub fn scan_range(&self, aggregate_id: AggregateId, from: Seq, to: Seq) -> EventScan<'_> {
        let range = ScanRange {
            aggregate_id,
            from: from.max(1),
            to,
        };
        if let Some(observer) = &self.observer {
            observer(&range);
        }
        debug!(aggregate_id = %aggregate_id, from = range.from, to, "scanning events");

        EventScan {
            store: self,
            range,
            next: range.from,
            buffer: VecDeque::new(),
            exhausted: range.from > range.to,
            failed: None,
        }
    }

    /// The whole rewind-marker index of a stream, ascending by marker seq.
    pub fn markers(&self, aggregate_id: AggregateId) -> Result<Vec<MarkerEntry>, EventStoreError> {
        let end = keys::prefix_end(&keys::markers_prefix(aggregate_id));
        let mut start = keys::markers_prefix(aggregate_id);
        let mut entries = Vec::new();

        loop {
            let page = self.kv.scan(&start, &end, self.page_size)?;
            let full = page.len() == self.page_size;
            for (key, bytes) in &page {
                entries.push(MarkerEntry {
                    seq: keys::seq_suffix(key)?,
                    horizon: keys::decode_seq(key, bytes)?,
                });
            }
            match entries.last() {
                Some(last) if full => start = keys::marker(aggregate_id, last.seq.saturating_add(1)),
                _ => break,
            }
        }
        Ok(entries)
    }

    /// Stage an append inside a caller-owned transaction (see [`KvEventStore::append`]).
    pub(crate) fn stage_append(
        &self,
        txn: &mut dyn WriteTxn,
        aggregate_id: AggregateId,
        expected_seq: Seq,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let actual = read_head(aggregate_id, txn.get(&keys::head(aggregate_id))?)?;
        if actual != expected_seq {
            return Err(EventStoreError::Concurrency {
                aggregate_id,
                expected: expected_seq,
                actual,
            });
        }

        let mut seq = actual;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            seq += 1;
            let stored = EventEnvelope::new(
                e.event_id,
                aggregate_id,
                seq,
                e.event_type,
                e.event_version,
                e.occurred_at,
                e.payload,
            );
            put_event(txn, &stored)?;
            committed.push(stored);
        }
        txn.put(keys::head(aggregate_id), keys::encode_seq(seq));

        Ok(committed)
    }

    /// Stage a verbatim copy of `source` events `1..=through` into the empty stream
    /// `target`, marker-index entries included. The copies keep their ids, seqs and
    /// payloads; only the aggregate id changes.
    pub(crate) fn stage_copy_prefix(
        &self,
        txn: &mut dyn WriteTxn,
        source: AggregateId,
        target: AggregateId,
        through: Seq,
    ) -> Result<(), EventStoreError> {
        let existing = read_head(target, txn.get(&keys::head(target))?)?;
        if existing != 0 {
            return Err(EventStoreError::InvalidAppend(format!(
                "copy target {target} already holds {existing} events"
            )));
        }

        let mut next: Seq = 1;
        while next <= through {
            let (start, end) = keys::event_range(source, next, through);
            let page = txn.scan(&start, &end, self.page_size)?;
            if page.is_empty() {
                break;
            }
            for (key, bytes) in page {
                let event = decode_event(&key, &bytes)?;
                if event.sequence_number() != next {
                    return Err(gap(source, next, event.sequence_number()).into());
                }
                put_event(txn, &event.rehomed(target))?;
                next += 1;
            }
        }
        if next <= through {
            return Err(StorageError::Corrupt(format!(
                "{source} ends at seq {} before seq {through}",
                next - 1
            ))
            .into());
        }

        txn.put(keys::head(target), keys::encode_seq(through));
        Ok(())
    }
}

pub(crate) fn read_head(aggregate_id: AggregateId, value: Option<Vec<u8>>) -> Result<Seq, StorageError> {
    match value {
        Some(bytes) => keys::decode_seq(&keys::head(aggregate_id), &bytes),
        None => Ok(0),
    }
}

fn put_event(txn: &mut dyn WriteTxn, event: &StoredEvent) -> Result<(), EventStoreError> {
    let aggregate_id = event.aggregate_id();
    let seq = event.sequence_number();

    if event.event_type() == REWIND_MARKER {
        let horizon = match PipelineEvent::decode(REWIND_MARKER, event.payload()) {
            Ok(Some(PipelineEvent::RewindMarker(marker))) => marker.horizon_seq,
            _ => {
                return Err(EventStoreError::InvalidAppend(format!(
                    "rewind marker at seq {seq} has an unreadable horizon"
                )));
            }
        };
        if horizon >= seq {
            return Err(EventStoreError::InvalidAppend(format!(
                "rewind marker at seq {seq} cannot keep seq {horizon} active"
            )));
        }
        txn.put(keys::marker(aggregate_id, seq), keys::encode_seq(horizon));
    }

    let bytes = serde_json::to_vec(event).map_err(StorageError::from)?;
    txn.put(keys::event(aggregate_id, seq), bytes);
    Ok(())
}

fn decode_event(key: &str, bytes: &[u8]) -> Result<StoredEvent, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt(format!("event at '{key}': {e}")))
}

fn gap(aggregate_id: AggregateId, expected: Seq, found: Seq) -> StorageError {
    StorageError::Corrupt(format!(
        "gap in stream {aggregate_id}: expected seq {expected}, found {found}"
    ))
}

/// Lazy, paged iterator over one stream range.
pub struct EventScan<'a> {
    store: &'a KvEventStore,
    range: ScanRange,
    next: Seq,
    buffer: VecDeque<StoredEvent>,
    exhausted: bool,
    failed: Option<EventStoreError>,
}

impl EventScan<'_> {
    pub fn range(&self) -> ScanRange {
        self.range
    }

    fn fill(&mut self) -> Result<(), EventStoreError> {
        let aggregate_id = self.range.aggregate_id;
        let (start, end) = keys::event_range(aggregate_id, self.next, self.range.to);
        let page = self.store.kv.scan(&start, &end, self.store.page_size)?;
        if page.len() < self.store.page_size {
            self.exhausted = true;
        }

        for (key, bytes) in page {
            let event = decode_event(&key, &bytes)?;
            if event.sequence_number() != self.next {
                return Err(gap(aggregate_id, self.next, event.sequence_number()).into());
            }
            self.buffer.push_back(event);
            match self.next.checked_add(1) {
                Some(next) if next <= self.range.to => self.next = next,
                _ => self.exhausted = true,
            }
        }
        Ok(())
    }
}

impl Iterator for EventScan<'_> {
    type Item = Result<StoredEvent, EventStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                // Events read before the failure are still handed out first.
                self.exhausted = true;
                self.failed = Some(err);
            }
        }
        match self.buffer.pop_front() {
            Some(event) => Some(Ok(event)),
            None => self.failed.take().map(Err),
        }
    }
}
