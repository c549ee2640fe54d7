use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use runlog_core::{AggregateId, Seq};

/// Envelope for an event, containing stream metadata.
///
/// This is the unit persisted in an aggregate stream and published after commit.
///
/// Notes:
/// - **Append-only**: `sequence_number` is assigned by the log store, starts at 1 and
///   increases by exactly 1 per event within one aggregate.
/// - `event_type` + `event_version` identify how to decode `payload`.
/// - When a branch copies its parent's prefix, the copy keeps `event_id`,
///   `sequence_number`, type, payload and `occurred_at`; only `aggregate_id` differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    aggregate_id: AggregateId,

    /// Monotonically increasing position in the aggregate stream.
    sequence_number: Seq,

    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        aggregate_id: AggregateId,
        sequence_number: Seq,
        event_type: impl Into<String>,
        event_version: u32,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            sequence_number,
            event_type: event_type.into(),
            event_version,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn sequence_number(&self) -> Seq {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Re-home the envelope onto another aggregate stream, keeping everything else.
    ///
    /// Used when a branch materializes its parent's history prefix.
    pub fn rehomed(&self, aggregate_id: AggregateId) -> Self
    where
        E: Clone,
    {
        Self {
            event_id: self.event_id,
            aggregate_id,
            sequence_number: self.sequence_number,
            event_type: self.event_type.clone(),
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            payload: self.payload.clone(),
        }
    }
}
