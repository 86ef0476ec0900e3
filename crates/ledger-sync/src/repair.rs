//! Rebuilding the merkle trie from the message log.

use ledger_crdt::MerkleTrie;
use ledger_store::{ClockStore, MessageLog, ReplicaStore, TransactionError};
use tracing::{info, warn};

use crate::engine::SyncEngine;
use crate::error::SyncError;

/// Result of comparing the in-use trie with one rebuilt from the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieReport {
    /// Messages in the log.
    pub messages: u64,
    /// Root hash of the trie in use.
    pub current_hash: u32,
    /// Root hash of the rebuilt trie.
    pub rebuilt_hash: u32,
}

impl TrieReport {
    /// Whether the trie in use summarizes exactly the logged messages.
    pub fn matches(&self) -> bool {
        self.current_hash == self.rebuilt_hash
    }
}

impl<S: ReplicaStore> SyncEngine<S> {
    /// Build a fresh trie over every logged timestamp.
    pub fn rebuild_trie(&self) -> Result<MerkleTrie, SyncError> {
        let timestamps = self.store.all_timestamps().map_err(SyncError::store)?;
        Ok(MerkleTrie::from_timestamps(&timestamps).prune(self.config.prune_keep))
    }

    /// Compare the trie in use with one rebuilt from the log.
    pub fn verify_trie(&self) -> Result<TrieReport, SyncError> {
        let rebuilt = self.rebuild_trie()?;
        let report = TrieReport {
            messages: rebuilt.count(),
            current_hash: self.state.trie.hash(),
            rebuilt_hash: rebuilt.hash(),
        };
        if !report.matches() {
            warn!(
                current = report.current_hash,
                rebuilt = report.rebuilt_hash,
                "trie does not match the message log"
            );
        }
        Ok(report)
    }

    /// Replace the trie with one rebuilt from the log and persist it.
    pub fn repair_trie(&mut self) -> Result<TrieReport, SyncError> {
        let mut report = self.verify_trie()?;
        let mut working = self.state.clone();
        working.trie = self.rebuild_trie()?;
        let record = working.record()?;

        self.store
            .transaction(|tx| tx.save_clock(&record))
            .map_err(|e| match e {
                TransactionError::Store(e) | TransactionError::Aborted(e) => SyncError::store(e),
            })?;
        self.state = working;
        report.current_hash = self.state.trie.hash();
        info!(messages = report.messages, hash = report.rebuilt_hash, "trie rebuilt");
        Ok(report)
    }
}
