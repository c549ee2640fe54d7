//! Aggregate root trait for event-sourced state.

use crate::id::AggregateId;

/// Position of an event inside one aggregate stream.
///
/// Sequence numbers start at 1; `0` denotes "empty stream" when used as a head.
pub type Seq = u64;

/// Aggregate root marker + minimal interface.
///
/// Implemented by reconstructed state values. The state itself is derived
/// data: it is rebuilt from the event stream and never persisted as the
/// source of truth.
pub trait AggregateRoot {
    /// Returns the aggregate identifier.
    fn id(&self) -> AggregateId;

    /// Sequence number of the last event that changed this state.
    ///
    /// Events without a projection effect (e.g. rewind markers) do not move it.
    fn version(&self) -> Seq;
}
