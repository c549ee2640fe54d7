use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use runlog_core::{AggregateId, Seq};
use runlog_events::{Event, EventEnvelope};

use crate::kv::StorageError;

/// A persisted event: an envelope with a JSON payload and an assigned sequence number.
pub type StoredEvent = EventEnvelope<JsonValue>;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// The store assigns `head + 1, head + 2, ...` during append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Capture a typed domain event together with the metadata needed to decode it later.
    pub fn from_typed<E>(event_id: Uuid, event: &E) -> Result<Self, EventStoreError>
    where
        E: Event,
    {
        let payload = event
            .to_payload()
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id,
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}

/// Event store operation error.
///
/// Infrastructure errors (storage, concurrency) as opposed to domain errors.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed on {aggregate_id}: expected head {expected}, found {actual}")]
    Concurrency {
        aggregate_id: AggregateId,
        expected: Seq,
        actual: Seq,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid append: {0}")]
    InvalidAppend(String),
}

/// A contiguous, inclusive range of sequence numbers requested from one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanRange {
    pub aggregate_id: AggregateId,
    pub from: Seq,
    pub to: Seq,
}

/// One entry of the rewind-marker index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerEntry {
    /// Sequence number of the marker event itself.
    pub seq: Seq,
    /// Highest seq the marker keeps active.
    pub horizon: Seq,
}
