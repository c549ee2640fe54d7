use thiserror::Error;

use runlog_core::{AggregateId, DomainError, Seq};

use crate::config::ConfigError;
use crate::event_store::EventStoreError;
use crate::kv::StorageError;

/// Errors surfaced by the history store operations.
///
/// Usage errors (bad branch point, bad rewind target, domain violations) are final.
/// Only [`HistoryError::ConcurrentAppendConflict`] is worth retrying, after reloading
/// the head.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("pipeline {aggregate_id} already started")]
    AlreadyStarted { aggregate_id: AggregateId },

    #[error("seq {seq} is not an active event of {aggregate_id} (horizon {horizon})")]
    InvalidBranchPoint {
        aggregate_id: AggregateId,
        seq: Seq,
        horizon: Seq,
    },

    #[error("cannot rewind {aggregate_id} to seq {seq}: {reason}")]
    InvalidRewindTarget {
        aggregate_id: AggregateId,
        seq: Seq,
        reason: String,
    },

    #[error("concurrent append on {aggregate_id}: expected head {expected}, found {actual}")]
    ConcurrentAppendConflict {
        aggregate_id: AggregateId,
        expected: Seq,
        actual: Seq,
    },

    #[error("aggregate {0} not found")]
    NotFound(AggregateId),

    #[error(transparent)]
    Domain(DomainError),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("replay cancelled")]
    Cancelled,
}

impl HistoryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HistoryError::ConcurrentAppendConflict { .. })
    }

    /// Attach the aggregate to a projector rejection.
    pub(crate) fn domain(aggregate_id: AggregateId, err: DomainError) -> Self {
        match err {
            DomainError::AlreadyStarted => HistoryError::AlreadyStarted { aggregate_id },
            other => HistoryError::Domain(other),
        }
    }
}

impl From<EventStoreError> for HistoryError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::Concurrency {
                aggregate_id,
                expected,
                actual,
            } => HistoryError::ConcurrentAppendConflict {
                aggregate_id,
                expected,
                actual,
            },
            EventStoreError::Storage(e) => HistoryError::Storage(e),
            EventStoreError::InvalidAppend(msg) => HistoryError::InvalidEvent(msg),
        }
    }
}
