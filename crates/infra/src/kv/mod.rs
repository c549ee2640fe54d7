//! Ordered key-value engine boundary.
//!
//! Everything the history store persists goes through [`KvEngine`]: events, heads,
//! the rewind-marker index, snapshots with their index, and branch edges. The contract is
//! small enough for a durable engine to sit behind it:
//!
//! - point reads and ascending range scans over `[start, end)`
//! - one write transaction at a time, applied atomically on `commit`
//! - no deletes (history is append-only)
//! - bounded lock waits: a busy engine answers [`StorageError::LockTimeout`]

use std::sync::Arc;

use thiserror::Error;

mod memory;

pub use memory::InMemoryKv;

/// A key and its stored bytes.
pub type KvPair = (String, Vec<u8>);

/// Storage-level failure.
///
/// A failed operation never leaves partial state: an uncommitted transaction is
/// discarded when dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("timed out waiting for a storage lock")]
    LockTimeout,

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Ordered KV engine.
pub trait KvEngine: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Up to `limit` pairs with `start <= key < end`, ascending by key.
    fn scan(&self, start: &str, end: &str, limit: usize) -> Result<Vec<KvPair>, StorageError>;

    /// Open the (single) write transaction, waiting at most the engine's lock timeout.
    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>, StorageError>;
}

/// Pending writes plus read-your-writes access to the committed data.
///
/// Dropping the transaction without calling [`WriteTxn::commit`] discards it.
pub trait WriteTxn {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Like [`KvEngine::scan`], with this transaction's pending puts overlaid.
    fn scan(&self, start: &str, end: &str, limit: usize) -> Result<Vec<KvPair>, StorageError>;

    fn put(&mut self, key: String, value: Vec<u8>);

    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

impl<K> KvEngine for Arc<K>
where
    K: KvEngine + ?Sized,
{
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).get(key)
    }

    fn scan(&self, start: &str, end: &str, limit: usize) -> Result<Vec<KvPair>, StorageError> {
        (**self).scan(start, end, limit)
    }

    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>, StorageError> {
        (**self).begin_write()
    }
}
