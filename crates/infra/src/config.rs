//! History store configuration.
//!
//! Only the shape and validation live here; the embedding application decides where
//! the values come from.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// When the snapshot manager persists a new baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotPolicy {
    /// Effective events a stream needs before its first snapshot.
    pub first_after: u64,
    /// Effective events after the newest valid snapshot before the next one.
    pub every: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            first_after: 10,
            every: 100,
        }
    }
}

/// Configuration for [`crate::HistoryStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub snapshot: SnapshotPolicy,
    /// Reconstructed states kept in the LRU cache (`0` disables caching)
    pub cache_capacity: usize,
    /// Attempts after the first for rewind and branch creation under contention
    pub max_conflict_retries: u32,
    /// Events fetched per KV round trip
    pub scan_page_size: usize,
    /// Evaluate the snapshot policy on a background thread after each commit
    pub background_snapshots: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            snapshot: SnapshotPolicy::default(),
            cache_capacity: 256,
            max_conflict_retries: 5,
            scan_page_size: 256,
            background_snapshots: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl HistoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot.first_after == 0 || self.snapshot.every == 0 {
            return Err(ConfigError::Invalid(
                "snapshot thresholds must be at least 1".to_string(),
            ));
        }
        if self.scan_page_size == 0 {
            return Err(ConfigError::Invalid("scan_page_size must be at least 1".to_string()));
        }
        Ok(())
    }
}
