//! Snapshots: checksummed state baselines that bound replay length.
//!
//! A snapshot is only a cache of the fold. It is used as a replay baseline when its
//! `through_seq` is still an active seq of the stream's current effective view, which
//! guarantees that the events it folded are exactly the effective events up to that
//! seq. Anything else (a rewound-away seq, a bad checksum, an undecodable body) is
//! passed over and replay falls back to an older snapshot or to genesis.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use runlog_core::{AggregateId, AggregateRoot, Seq};
use runlog_pipeline::PipelineState;

use crate::config::SnapshotPolicy;
use crate::keys;
use crate::kv::{KvEngine, StorageError};
use crate::resolver::EffectiveSlice;
use crate::stats::Counters;

mod worker;

pub use worker::{SnapshotWorker, WorkerHandle};

/// A state baseline folded through `through_seq`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub through_seq: Seq,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the serialized state.
    pub checksum: String,
    pub state: PipelineState,
}

/// Stored form: the state is kept as the exact JSON text the checksum covers.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    aggregate_id: AggregateId,
    through_seq: Seq,
    created_at: DateTime<Utc>,
    checksum: String,
    state: String,
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl Snapshot {
    pub fn capture(state: PipelineState, through_seq: Seq) -> Result<Self, StorageError> {
        let body = serde_json::to_string(&state)?;
        Ok(Self {
            aggregate_id: state.id(),
            through_seq,
            created_at: Utc::now(),
            checksum: checksum(body.as_bytes()),
            state,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        let record = SnapshotRecord {
            aggregate_id: self.aggregate_id,
            through_seq: self.through_seq,
            created_at: self.created_at,
            checksum: self.checksum.clone(),
            state: serde_json::to_string(&self.state)?,
        };
        Ok(serde_json::to_vec(&record)?)
    }

    /// Decode and verify; the error is the reason the record was refused.
    fn decode(bytes: &[u8]) -> Result<Self, String> {
        let record: SnapshotRecord =
            serde_json::from_slice(bytes).map_err(|e| format!("undecodable record: {e}"))?;
        if checksum(record.state.as_bytes()) != record.checksum {
            return Err("checksum mismatch".to_string());
        }
        let state = serde_json::from_str(&record.state).map_err(|e| format!("undecodable state: {e}"))?;

        Ok(Self {
            aggregate_id: record.aggregate_id,
            through_seq: record.through_seq,
            created_at: record.created_at,
            checksum: record.checksum,
            state,
        })
    }
}

/// Decides when to snapshot, writes snapshots and finds the newest usable one.
#[derive(Clone)]
pub struct SnapshotManager {
    kv: Arc<dyn KvEngine>,
    policy: SnapshotPolicy,
    page_size: usize,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SnapshotManager {
    pub(crate) fn new(
        kv: Arc<dyn KvEngine>,
        policy: SnapshotPolicy,
        page_size: usize,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            kv,
            policy,
            page_size: page_size.max(1),
            counters,
        }
    }

    pub fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    /// Policy decision given the view and the newest usable snapshot seq.
    pub fn is_due(&self, slice: &EffectiveSlice, latest: Option<Seq>) -> bool {
        match latest {
            None => slice.len() >= self.policy.first_after,
            Some(through_seq) => slice.count_after(through_seq) >= self.policy.every,
        }
    }

    /// Counts from the newest snapshot that would be used as a baseline, so a
    /// corrupt snapshot never postpones its replacement.
    pub fn should_snapshot(&self, slice: &EffectiveSlice) -> Result<bool, StorageError> {
        let latest = self.load_latest_valid(slice)?.map(|s| s.through_seq);
        Ok(self.is_due(slice, latest))
    }

    /// Newest indexed snapshot seq active in `slice`, without reading or verifying
    /// the body.
    pub fn latest_candidate(&self, slice: &EffectiveSlice) -> Result<Option<Seq>, StorageError> {
        Ok(self.candidates(slice)?.pop())
    }

    pub fn snapshot(&self, state: &PipelineState, through_seq: Seq) -> Result<Snapshot, StorageError> {
        let snapshot = Snapshot::capture(state.clone(), through_seq)?;

        let mut txn = self.kv.begin_write()?;
        txn.put(keys::snapshot(snapshot.aggregate_id, through_seq), snapshot.encode()?);
        txn.put(keys::snapshot_index(snapshot.aggregate_id, through_seq), Vec::new());
        txn.commit()?;

        Counters::bump(&self.counters.snapshots_written);
        info!(
            aggregate_id = %snapshot.aggregate_id,
            through_seq,
            checksum = %snapshot.checksum,
            "snapshot written"
        );
        Ok(snapshot)
    }

    /// Newest snapshot that verifies and whose seq is active in `slice`.
    ///
    /// Bodies are read newest first and the search stops at the first one that
    /// verifies, so older snapshots are never loaded.
    pub fn load_latest_valid(&self, slice: &EffectiveSlice) -> Result<Option<Snapshot>, StorageError> {
        let aggregate_id = slice.aggregate_id;

        for through_seq in self.candidates(slice)?.into_iter().rev() {
            let key = keys::snapshot(aggregate_id, through_seq);
            let Some(bytes) = self.kv.get(&key)? else {
                self.reject(aggregate_id, through_seq, "indexed snapshot is missing");
                continue;
            };
            match Snapshot::decode(&bytes) {
                Ok(snapshot) if snapshot.aggregate_id == aggregate_id && snapshot.through_seq == through_seq => {
                    return Ok(Some(snapshot));
                }
                Ok(_) => self.reject(aggregate_id, through_seq, "record does not match its key"),
                Err(reason) => self.reject(aggregate_id, through_seq, &reason),
            }
        }
        Ok(None)
    }

    fn reject(&self, aggregate_id: AggregateId, through_seq: Seq, reason: &str) {
        Counters::bump(&self.counters.snapshots_rejected);
        warn!(aggregate_id = %aggregate_id, through_seq, reason, "ignoring snapshot");
    }

    /// Indexed snapshot seqs that are active in `slice`, ascending.
    fn candidates(&self, slice: &EffectiveSlice) -> Result<Vec<Seq>, StorageError> {
        if slice.horizon == 0 {
            return Ok(Vec::new());
        }
        let aggregate_id = slice.aggregate_id;
        let end = keys::snapshot_index(aggregate_id, slice.horizon.saturating_add(1));
        let mut start = keys::snapshot_index_prefix(aggregate_id);
        let mut seqs = Vec::new();

        loop {
            let page = self.kv.scan(&start, &end, self.page_size)?;
            let full = page.len() == self.page_size;
            let mut last = None;
            for (key, _) in &page {
                let seq = keys::seq_suffix(key)?;
                if slice.is_active(seq) {
                    seqs.push(seq);
                }
                last = Some(seq);
            }
            match last {
                Some(seq) if full => start = keys::snapshot_index(aggregate_id, seq.saturating_add(1)),
                _ => break,
            }
        }
        Ok(seqs)
    }
}
