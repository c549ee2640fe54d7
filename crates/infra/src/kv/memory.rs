use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::{KvEngine, KvPair, StorageError, WriteTxn};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory ordered KV engine.
///
/// Intended for tests/dev. Writers are serialized by a mutex held for the lifetime of
/// the transaction; the data lock is only taken for writing while a commit is applied,
/// so readers see the map either before or after a commit.
#[derive(Debug)]
pub struct InMemoryKv {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    writer: Mutex<()>,
    lock_timeout: Duration,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            lock_timeout,
            ..Self::default()
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_range(&self, start: &str, end: &str, limit: usize) -> Result<Vec<KvPair>, StorageError> {
        let data = self
            .data
            .try_read_for(self.lock_timeout)
            .ok_or(StorageError::LockTimeout)?;
        Ok(range(&data, start, end, limit))
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

fn range(map: &BTreeMap<String, Vec<u8>>, start: &str, end: &str, limit: usize) -> Vec<KvPair> {
    if start >= end || limit == 0 {
        return Vec::new();
    }
    map.range::<str, _>((Bound::Included(start), Bound::Excluded(end)))
        .take(limit)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl KvEngine for InMemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self
            .data
            .try_read_for(self.lock_timeout)
            .ok_or(StorageError::LockTimeout)?;
        Ok(data.get(key).cloned())
    }

    fn scan(&self, start: &str, end: &str, limit: usize) -> Result<Vec<KvPair>, StorageError> {
        self.read_range(start, end, limit)
    }

    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>, StorageError> {
        let guard = self
            .writer
            .try_lock_for(self.lock_timeout)
            .ok_or(StorageError::LockTimeout)?;

        Ok(Box::new(MemoryTxn {
            kv: self,
            _writer: guard,
            pending: BTreeMap::new(),
        }))
    }
}

struct MemoryTxn<'a> {
    kv: &'a InMemoryKv,
    _writer: MutexGuard<'a, ()>,
    pending: BTreeMap<String, Vec<u8>>,
}

impl WriteTxn for MemoryTxn<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.pending.get(key) {
            Some(value) => Ok(Some(value.clone())),
            None => self.kv.get(key),
        }
    }

    fn scan(&self, start: &str, end: &str, limit: usize) -> Result<Vec<KvPair>, StorageError> {
        // The first `limit` keys of the union are among the first `limit` of each side.
        let mut merged: BTreeMap<String, Vec<u8>> =
            self.kv.read_range(start, end, limit)?.into_iter().collect();
        merged.extend(range(&self.pending, start, end, limit));
        Ok(merged.into_iter().take(limit).collect())
    }

    fn put(&mut self, key: String, value: Vec<u8>) {
        self.pending.insert(key, value);
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTxn { kv, _writer, pending } = *self;
        let mut data = kv
            .data
            .try_write_for(kv.lock_timeout)
            .ok_or(StorageError::LockTimeout)?;
        data.extend(pending);
        Ok(())
    }
}
