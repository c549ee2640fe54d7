//! Append-only event log over the KV engine.
//!
//! One stream per aggregate, strictly ordered by `sequence_number`. Appends are
//! compare-and-append against the stored head; nothing is ever rewritten.

mod kv;
mod types;

pub use kv::{EventScan, KvEventStore, ScanObserver};
pub use types::{EventStoreError, MarkerEntry, ScanRange, StoredEvent, UncommittedEvent};

pub(crate) use kv::read_head;
