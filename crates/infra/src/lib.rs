//! Storage side of the pipeline-run history: the KV boundary, the append-only event
//! log, effective-event resolution, snapshots, branches, the state cache and the
//! [`HistoryStore`] facade over all of them.

pub mod branch;
pub mod cache;
pub mod config;
pub mod error;
pub mod event_store;
pub mod history;
pub mod kv;
pub mod resolver;
pub mod snapshot;

mod keys;
mod stats;

mod integration_tests;

pub use branch::{BranchEdge, BranchIndex, BranchManager, RewindAck};
pub use cache::StateCache;
pub use config::{ConfigError, HistoryConfig, SnapshotPolicy};
pub use error::HistoryError;
pub use event_store::{EventStoreError, KvEventStore, ScanObserver, ScanRange, StoredEvent};
pub use history::{CancelToken, CommitBus, HistoryStore, HistoryStoreBuilder};
pub use kv::{InMemoryKv, KvEngine, StorageError, WriteTxn};
pub use resolver::{EffectiveEventResolver, EffectiveSlice, Segment};
pub use snapshot::{Snapshot, SnapshotManager};
pub use stats::HistoryStats;
