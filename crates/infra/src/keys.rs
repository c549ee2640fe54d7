//! Persisted key layout.
//!
//! Sequence numbers are zero-padded to 20 digits (the width of `u64::MAX`) so that
//! lexical key order is numeric order.

use runlog_core::{AggregateId, Seq};

use crate::kv::StorageError;

pub(crate) fn event(aggregate_id: AggregateId, seq: Seq) -> String {
    format!("ev/{aggregate_id}/{seq:020}")
}

pub(crate) fn events_prefix(aggregate_id: AggregateId) -> String {
    format!("ev/{aggregate_id}/")
}

/// `[start, end)` keys covering events `from..=to`.
pub(crate) fn event_range(aggregate_id: AggregateId, from: Seq, to: Seq) -> (String, String) {
    let start = event(aggregate_id, from);
    let end = match to.checked_add(1) {
        Some(next) => event(aggregate_id, next),
        None => prefix_end(&events_prefix(aggregate_id)),
    };
    (start, end)
}

pub(crate) fn head(aggregate_id: AggregateId) -> String {
    format!("hd/{aggregate_id}")
}

pub(crate) fn marker(aggregate_id: AggregateId, seq: Seq) -> String {
    format!("rw/{aggregate_id}/{seq:020}")
}

pub(crate) fn markers_prefix(aggregate_id: AggregateId) -> String {
    format!("rw/{aggregate_id}/")
}

pub(crate) fn snapshot(aggregate_id: AggregateId, through_seq: Seq) -> String {
    format!("sn/{aggregate_id}/{through_seq:020}")
}

/// Empty-valued entry listing a stored snapshot, so candidates are found without
/// reading snapshot bodies.
pub(crate) fn snapshot_index(aggregate_id: AggregateId, through_seq: Seq) -> String {
    format!("si/{aggregate_id}/{through_seq:020}")
}

pub(crate) fn snapshot_index_prefix(aggregate_id: AggregateId) -> String {
    format!("si/{aggregate_id}/")
}

pub(crate) fn parent_edge(child_id: AggregateId) -> String {
    format!("br/up/{child_id}")
}

pub(crate) fn child_edge(parent_id: AggregateId, child_id: AggregateId) -> String {
    format!("br/down/{parent_id}/{child_id}")
}

pub(crate) fn children_prefix(parent_id: AggregateId) -> String {
    format!("br/down/{parent_id}/")
}

/// Exclusive upper bound for every key under `prefix` (which ends in `/`).
pub(crate) fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.trim_end_matches('/').to_string();
    end.push('0');
    end
}

/// Sequence number encoded in the last path segment of `key`.
pub(crate) fn seq_suffix(key: &str) -> Result<Seq, StorageError> {
    key.rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StorageError::Corrupt(format!("key '{key}' has no sequence suffix")))
}

pub(crate) fn encode_seq(seq: Seq) -> Vec<u8> {
    seq.to_string().into_bytes()
}

pub(crate) fn decode_seq(key: &str, bytes: &[u8]) -> Result<Seq, StorageError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StorageError::Corrupt(format!("value at '{key}' is not a sequence number")))
}
