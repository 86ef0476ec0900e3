//! Receiving messages from peers and the full-sync loop.

use ledger_crdt::message::applied_tables;
use ledger_crdt::{Message, SyncMode, SyncRequest, Timestamp, WireMessage};
use ledger_store::{MessageLog, ReplicaStore};
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::listeners::SyncEvent;
use crate::transport::SyncTransport;

impl<S: ReplicaStore> SyncEngine<S> {
    /// Apply messages received from a peer.
    ///
    /// The clock observes every timestamp first; a timestamp from this
    /// replica's own node, or one too far in the future, fails the whole
    /// batch before anything is written.
    pub fn receive(&mut self, messages: Vec<Message>) -> Result<Vec<Message>, SyncError> {
        let mut working = self.state.clone();
        for msg in &messages {
            working.clock.recv(&msg.timestamp)?;
        }
        self.apply_with(working, messages)
    }

    /// Decode and apply messages in their wire form.
    pub fn receive_wire(&mut self, messages: &[WireMessage]) -> Result<Vec<Message>, SyncError> {
        let messages = messages
            .iter()
            .map(Message::from_wire)
            .collect::<Result<Vec<_>, _>>()?;
        self.receive(messages)
    }

    /// Push then pull in one step: collect local messages logged after
    /// `since`, apply the peer's `messages`, and return the local ones.
    pub fn sync_and_receive(
        &mut self,
        messages: Vec<Message>,
        since: &Timestamp,
    ) -> Result<Vec<Message>, SyncError> {
        let local = self.store.messages_since(since).map_err(SyncError::store)?;
        self.receive(messages)?;
        Ok(local)
    }

    /// Exchange messages with a peer until both tries agree.
    ///
    /// Each round sends every local message after `since` and applies what
    /// the peer returns. When the tries still differ the next round starts at
    /// the earliest differing window. Only runs in [`SyncMode::Enabled`];
    /// otherwise returns nothing.
    ///
    /// Returns every message received. Emits [`SyncEvent::Success`] or
    /// [`SyncEvent::Error`].
    pub fn full_sync<T: SyncTransport>(
        &mut self,
        transport: &mut T,
    ) -> Result<Vec<Message>, SyncError> {
        if self.mode != SyncMode::Enabled {
            debug!(mode = %self.mode, "full sync skipped");
            return Ok(Vec::new());
        }

        match self.sync_rounds(transport) {
            Ok(received) => {
                self.hooks.emit(&SyncEvent::Success {
                    tables: applied_tables(&received),
                });
                Ok(received)
            }
            Err(e) => {
                warn!(error = %e, "full sync failed");
                self.hooks.emit(&SyncEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn sync_rounds<T: SyncTransport>(
        &mut self,
        transport: &mut T,
    ) -> Result<Vec<Message>, SyncError> {
        let mut since = self.last_synced.unwrap_or_else(|| {
            let now = self.state.clock.physical_time();
            Timestamp::since_millis(now.saturating_sub(self.config.default_lookback_ms))
        });
        let mut received = Vec::new();
        let mut prev_diff = None;
        let mut round = 0;

        loop {
            let local = self.store.messages_since(&since).map_err(SyncError::store)?;
            let request = SyncRequest {
                node: self.state.node(),
                since,
                messages: local.iter().map(Message::to_wire).collect(),
            };
            debug!(round, %since, sent = request.messages.len(), "sync round");

            let response = transport.exchange(request)?;
            if !response.messages.is_empty() {
                let incoming = response
                    .messages
                    .iter()
                    .map(Message::from_wire)
                    .collect::<Result<Vec<_>, _>>()?;
                received.extend(self.receive(incoming)?);
            }

            let Some(diff) = response.merkle.earliest_divergence(&self.state.trie) else {
                self.last_synced = Some(self.state.clock.last_timestamp());
                info!(rounds = round + 1, received = received.len(), "full sync complete");
                return Ok(received);
            };

            let stuck = round >= self.config.max_same_diff_rounds && prev_diff == Some(diff);
            if stuck || round >= self.config.max_sync_rounds {
                return Err(SyncError::OutOfSync { rounds: round + 1 });
            }
            debug!(round, diff, "tries diverge, syncing again");
            prev_diff = Some(diff);
            since = Timestamp::since_millis(diff);
            round += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_crdt::{Change, ClockError, Dataset, NodeId, SyncResponse, Value};
    use ledger_store::MemoryStore;

    fn fixed_time() -> u64 {
        1_700_000_000_000
    }

    fn engine(mode: SyncMode) -> SyncEngine<MemoryStore> {
        SyncEngine::builder(MemoryStore::new())
            .mode(mode)
            .time_source(fixed_time)
            .build()
            .unwrap()
    }

    fn remote(millis: u64, value: i32) -> Message {
        let ts = Timestamp::new(millis, 0, NodeId::new("REMOTE").unwrap());
        Message::new(Dataset::Transactions, "t1", "amount", value, ts)
    }

    #[test]
    fn receive_advances_clock_past_remote() {
        let mut engine = engine(SyncMode::Enabled);
        let msg = remote(fixed_time() + 1_000, -600);
        engine.receive(vec![msg.clone()]).unwrap();
        assert!(engine.clock().last_timestamp() > msg.timestamp);
        assert_eq!(
            engine.store().field(Dataset::Transactions, "t1", "amount"),
            Some(&Value::from(-600))
        );
    }

    #[test]
    fn receive_rejects_own_node() {
        let mut engine = engine(SyncMode::Enabled);
        let ts = Timestamp::new(1_000, 0, engine.node());
        let own = Message::new(Dataset::Notes, "n1", "note", "x", ts);
        let err = engine.receive(vec![own]).unwrap_err();
        assert!(matches!(err, SyncError::Clock(ClockError::Skew(_))));
        assert_eq!(engine.store().message_count().unwrap(), 0);
    }

    #[test]
    fn sync_and_receive_returns_local_messages() {
        let mut engine = engine(SyncMode::Enabled);
        let sent = engine
            .send(vec![Change::new(Dataset::Notes, "n1", "note", "mine")])
            .unwrap();
        let local = engine
            .sync_and_receive(vec![remote(fixed_time() - 10, -1)], &Timestamp::zero())
            .unwrap();
        assert_eq!(local, sent);
        assert_eq!(engine.store().message_count().unwrap(), 2);
    }

    struct Stubborn {
        rounds: usize,
    }

    impl SyncTransport for Stubborn {
        fn exchange(&mut self, _: SyncRequest) -> Result<SyncResponse, SyncError> {
            self.rounds += 1;
            let ts = Timestamp::new(60_000, 0, NodeId::new("PEER").unwrap());
            Ok(SyncResponse {
                messages: Vec::new(),
                merkle: ledger_crdt::MerkleTrie::new().insert(&ts),
            })
        }
    }

    #[test]
    fn gives_up_when_divergence_does_not_move() {
        let mut engine = engine(SyncMode::Enabled);
        let mut transport = Stubborn { rounds: 0 };
        let err = engine.full_sync(&mut transport).unwrap_err();
        assert!(matches!(err, SyncError::OutOfSync { rounds: 11 }));
        assert_eq!(transport.rounds, 11);
        assert!(engine.last_synced().is_none());
    }

    #[test]
    fn full_sync_is_skipped_offline() {
        let mut engine = engine(SyncMode::Offline);
        let mut transport = Stubborn { rounds: 0 };
        assert!(engine.full_sync(&mut transport).unwrap().is_empty());
        assert_eq!(transport.rounds, 0);
    }
}
