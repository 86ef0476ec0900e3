//! The clock and trie owned by a replica, and their persisted record.

use ledger_crdt::{Clock, MerkleTrie, NodeId, Timestamp};
use ledger_store::ClockStore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SyncConfig;
use crate::error::SyncError;

/// Cross-batch mutable state of a replica.
///
/// The engine works on a clone during each batch and swaps it in only
/// after the store transaction commits.
#[derive(Debug, Clone)]
pub struct ReplicaState {
    /// Logical clock.
    pub clock: Clock,
    /// Summary of every logged message.
    pub trie: MerkleTrie,
}

#[derive(Serialize, Deserialize)]
struct ClockRecord {
    timestamp: Timestamp,
    merkle: MerkleTrie,
}

impl ReplicaState {
    /// Serialize for the clock record.
    pub fn record(&self) -> Result<String, SyncError> {
        let record = ClockRecord {
            timestamp: self.clock.last_timestamp(),
            merkle: self.trie.clone(),
        };
        serde_json::to_string(&record).map_err(SyncError::store)
    }

    /// Decode a clock record.
    pub fn from_record(
        record: &str,
        config: &SyncConfig,
        time_fn: fn() -> u64,
    ) -> Result<Self, SyncError> {
        let record: ClockRecord =
            serde_json::from_str(record).map_err(|e| SyncError::CorruptClock(e.to_string()))?;
        Ok(Self {
            clock: Clock::from_timestamp(record.timestamp)
                .time_source(time_fn)
                .max_drift(config.max_drift_ms),
            trie: record.merkle,
        })
    }

    /// Load the persisted record, or create and persist a fresh clock with
    /// a random node id.
    pub fn load_or_init<S: ClockStore>(
        store: &mut S,
        config: &SyncConfig,
        time_fn: fn() -> u64,
    ) -> Result<Self, SyncError> {
        if let Some(record) = store.load_clock().map_err(SyncError::store)? {
            return Self::from_record(&record, config, time_fn);
        }
        let state = Self {
            clock: Clock::with_time_source(NodeId::random(), time_fn)
                .max_drift(config.max_drift_ms),
            trie: MerkleTrie::new(),
        };
        store.save_clock(&state.record()?).map_err(SyncError::store)?;
        info!(node = %state.clock.node(), "created replica clock");
        Ok(state)
    }

    /// Node id of this replica.
    pub fn node(&self) -> NodeId {
        self.clock.node()
    }
}
