//! Exchanging messages with a sync peer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ledger_crdt::{Envelope, MerkleTrie, SyncRequest, SyncResponse, Timestamp, WireMessage};
use tracing::debug;

use crate::error::SyncError;

/// One request/response round trip with a sync peer.
pub trait SyncTransport {
    /// Send local messages and receive the peer's messages and trie.
    fn exchange(&mut self, request: SyncRequest) -> Result<SyncResponse, SyncError>;
}

/// An in-process stand-in for a sync server.
///
/// Holds every message of the group and a trie over them. Clones share the
/// same state, so several engines can sync through one relay.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayState>>,
}

#[derive(Debug, Default)]
struct RelayState {
    messages: BTreeMap<Timestamp, WireMessage>,
    trie: MerkleTrie,
    offline: bool,
}

impl MemoryRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer a request: store its messages, then return messages after
    /// `since` from other nodes along with the relay's trie.
    pub fn handle(&self, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        let mut state = self.lock();
        if state.offline {
            return Err(SyncError::Transport("relay unreachable".into()));
        }

        let messages: Vec<WireMessage> = state
            .messages
            .range(request.since..)
            .filter(|(ts, _)| **ts > request.since && ts.node() != request.node)
            .map(|(_, msg)| msg.clone())
            .collect();

        let mut added = 0;
        for msg in request.messages {
            let ts = Timestamp::parse(&msg.timestamp)?;
            if !state.messages.contains_key(&ts) {
                state.trie = state.trie.insert(&ts);
                state.messages.insert(ts, msg);
                added += 1;
            }
        }
        debug!(node = %request.node, added, returned = messages.len(), "relay handled request");

        Ok(SyncResponse {
            messages,
            merkle: state.trie.clone(),
        })
    }

    /// Answer an encoded request with an encoded response.
    pub fn handle_bytes(&self, request: &[u8]) -> Result<Vec<u8>, SyncError> {
        let request = SyncRequest::from_bytes(request)?;
        Ok(self.handle(request)?.to_bytes()?)
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    /// The relay's trie.
    pub fn trie(&self) -> MerkleTrie {
        self.lock().trie.clone()
    }

    /// Make the relay refuse requests until called again with `false`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }
}

impl SyncTransport for MemoryRelay {
    fn exchange(&mut self, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        let reply = self.handle_bytes(&request.to_bytes()?)?;
        Ok(SyncResponse::from_bytes(&reply)?)
    }
}
