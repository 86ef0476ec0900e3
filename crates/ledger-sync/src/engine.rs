//! The replica engine: owns the store, the replica state and the mode.

use std::sync::Arc;

use ledger_crdt::clock::system_time_ms;
use ledger_crdt::{
    Change, Clock, Dataset, MerkleTrie, Message, NodeId, SyncMode, Timestamp, Value,
};
use ledger_store::ReplicaStore;
use tracing::{info, warn};

use crate::apply;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::listeners::{
    ChangeObserver, EventCallback, Hooks, PreferenceStore, SubscriptionId, SyncEvent,
    UndoRecorder,
};
use crate::replica::ReplicaState;
use crate::snapshot::Snapshot;

/// A replica of the budget database.
///
/// Every batch of messages, whether stamped locally with
/// [`send`](Self::send) or received from a peer, goes through the same
/// pipeline and either commits completely or leaves the replica untouched.
///
/// # Example
///
/// ```
/// use ledger_crdt::{Change, Dataset, SyncMode, Value};
/// use ledger_store::MemoryStore;
/// use ledger_sync::SyncEngine;
///
/// let mut engine = SyncEngine::builder(MemoryStore::new())
///     .mode(SyncMode::Enabled)
///     .build()
///     .unwrap();
///
/// engine
///     .send(vec![Change::new(Dataset::Accounts, "a1", "name", "Checking")])
///     .unwrap();
///
/// let name = engine.store().field(Dataset::Accounts, "a1", "name");
/// assert_eq!(name, Some(&Value::from("Checking")));
/// assert_eq!(engine.trie().count(), 1);
/// ```
pub struct SyncEngine<S: ReplicaStore> {
    pub(crate) store: S,
    pub(crate) state: ReplicaState,
    pub(crate) mode: SyncMode,
    pub(crate) config: SyncConfig,
    pub(crate) hooks: Hooks,
    pub(crate) last_synced: Option<Timestamp>,
}

/// Builder for a [`SyncEngine`].
pub struct SyncEngineBuilder<S: ReplicaStore> {
    store: S,
    config: SyncConfig,
    mode: SyncMode,
    hooks: Hooks,
    time_fn: fn() -> u64,
}

impl<S: ReplicaStore> SyncEngineBuilder<S> {
    /// Set the engine configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the initial mode. Defaults to [`SyncMode::Disabled`].
    pub fn mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Register the reactive layer.
    pub fn observer(mut self, observer: Arc<dyn ChangeObserver>) -> Self {
        self.hooks.observer = Some(observer);
        self
    }

    /// Register the undo history.
    pub fn undo(mut self, undo: Arc<dyn UndoRecorder>) -> Self {
        self.hooks.undo = Some(undo);
        self
    }

    /// Replace the in-memory preference store.
    pub fn preferences(mut self, prefs: Arc<dyn PreferenceStore>) -> Self {
        self.hooks.prefs = prefs;
        self
    }

    /// Use a custom physical time source for the clock.
    pub fn time_source(mut self, time_fn: fn() -> u64) -> Self {
        self.time_fn = time_fn;
        self
    }

    /// Load the clock record (creating one if absent) and build the engine.
    pub fn build(mut self) -> Result<SyncEngine<S>, SyncError> {
        let state = ReplicaState::load_or_init(&mut self.store, &self.config, self.time_fn)?;
        info!(node = %state.node(), mode = %self.mode, "replica ready");
        Ok(SyncEngine {
            store: self.store,
            state,
            mode: self.mode,
            config: self.config,
            hooks: self.hooks,
            last_synced: None,
        })
    }
}

/// Changes collected by [`SyncEngine::batch`].
#[derive(Debug, Default)]
pub struct Batch {
    changes: Vec<Change>,
}

impl Batch {
    /// Queue a field assignment.
    pub fn set(
        &mut self,
        dataset: Dataset,
        row: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.changes.push(Change::new(dataset, row, column, value));
        self
    }

    /// Queue a prepared change.
    pub fn push(&mut self, change: Change) -> &mut Self {
        self.changes.push(change);
        self
    }

    /// Number of queued changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl<S: ReplicaStore> SyncEngine<S> {
    /// Start building an engine over `store`.
    pub fn builder(store: S) -> SyncEngineBuilder<S> {
        SyncEngineBuilder {
            store,
            config: SyncConfig::default(),
            mode: SyncMode::default(),
            hooks: Hooks::default(),
            time_fn: system_time_ms,
        }
    }

    /// Switch mode, returning the previous one.
    pub fn set_mode(&mut self, mode: SyncMode) -> SyncMode {
        let previous = std::mem::replace(&mut self.mode, mode);
        if previous != mode {
            info!(from = %previous, to = %mode, "sync mode changed");
        }
        previous
    }

    /// Current mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Whether the current mode satisfies `check`. See [`SyncMode::is_active`].
    pub fn is_active(&self, check: SyncMode) -> bool {
        self.mode.is_active(check)
    }

    /// Apply messages that are already stamped.
    ///
    /// Returns the messages that went through the pipeline, with `old` set on
    /// those superseded by a later logged write. Exact repeats of logged
    /// messages are not returned.
    pub fn apply_messages(&mut self, messages: Vec<Message>) -> Result<Vec<Message>, SyncError> {
        let working = self.state.clone();
        self.apply_with(working, messages)
    }

    pub(crate) fn apply_with(
        &mut self,
        mut working: ReplicaState,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, SyncError> {
        let committed = apply::commit(
            &mut self.store,
            &mut working,
            self.mode,
            &self.config,
            &self.hooks,
            messages,
        )?;
        self.state = working;
        apply::notify(&self.store, &self.config, &self.hooks, &committed);
        Ok(committed.messages)
    }

    /// Stamp local changes with the clock and apply them as one batch.
    ///
    /// A failure is also reported as [`SyncEvent::Error`].
    pub fn send(&mut self, changes: Vec<Change>) -> Result<Vec<Message>, SyncError> {
        let result = self.stamp_and_apply(changes);
        if let Err(e) = &result {
            warn!(error = %e, "local changes were not applied");
            self.hooks.emit(&SyncEvent::Error {
                kind: e.kind(),
                message: e.to_string(),
            });
        }
        result
    }

    fn stamp_and_apply(&mut self, changes: Vec<Change>) -> Result<Vec<Message>, SyncError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let mut working = self.state.clone();
        let messages = changes
            .into_iter()
            .map(|change| -> Result<Message, SyncError> {
                Ok(change.stamp(working.clock.now()?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.apply_with(working, messages)
    }

    /// Collect changes in `f` and send them together once it returns.
    ///
    /// ```
    /// # use ledger_crdt::{Dataset, SyncMode};
    /// # use ledger_store::MemoryStore;
    /// # use ledger_sync::SyncEngine;
    /// let mut engine = SyncEngine::builder(MemoryStore::new())
    ///     .mode(SyncMode::Enabled)
    ///     .build()
    ///     .unwrap();
    /// let sent = engine
    ///     .batch(|b| {
    ///         b.set(Dataset::Payees, "p1", "name", "Grocer")
    ///             .set(Dataset::Payees, "p1", "favorite", 1);
    ///     })
    ///     .unwrap();
    /// assert_eq!(sent.len(), 2);
    /// ```
    pub fn batch<F>(&mut self, f: F) -> Result<Vec<Message>, SyncError>
    where
        F: FnOnce(&mut Batch),
    {
        let mut batch = Batch::default();
        f(&mut batch);
        self.send(batch.changes)
    }

    /// Register a callback run after every committed batch with the touched
    /// rows before and after it.
    pub fn add_sync_listener<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Snapshot, &Snapshot) + Send + Sync + 'static,
    {
        self.hooks.sync_listeners.subscribe(Arc::new(listener))
    }

    /// Remove a sync listener. Returns `true` if it was registered.
    pub fn remove_sync_listener(&self, id: SubscriptionId) -> bool {
        self.hooks.sync_listeners.unsubscribe(id)
    }

    /// Subscribe to [`SyncEvent`]s.
    pub fn subscribe_events<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let callback: Arc<EventCallback> = Arc::new(callback);
        self.hooks.events.subscribe(callback)
    }

    /// Stop receiving events. Returns `true` if the subscription existed.
    pub fn unsubscribe_events(&self, id: SubscriptionId) -> bool {
        self.hooks.events.unsubscribe(id)
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the underlying store.
    ///
    /// Writes made here bypass the log and the trie.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Consume the engine, returning the store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// The replica's clock and trie.
    pub fn state(&self) -> &ReplicaState {
        &self.state
    }

    /// The replica's clock.
    pub fn clock(&self) -> &Clock {
        &self.state.clock
    }

    /// The replica's merkle trie.
    pub fn trie(&self) -> &MerkleTrie {
        &self.state.trie
    }

    /// This replica's node id.
    pub fn node(&self) -> NodeId {
        self.state.node()
    }

    /// Active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Clock value at the end of the last successful full sync.
    pub fn last_synced(&self) -> Option<Timestamp> {
        self.last_synced
    }

    /// Restore the last synced timestamp saved by the application.
    pub fn set_last_synced(&mut self, timestamp: Option<Timestamp>) {
        self.last_synced = timestamp;
    }
}

impl<S: ReplicaStore + std::fmt::Debug> std::fmt::Debug for SyncEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store", &self.store)
            .field("node", &self.state.node())
            .field("mode", &self.mode)
            .field("last_synced", &self.last_synced)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_store::{MemoryStore, MessageLog};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

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

    #[test]
    fn send_stamps_with_increasing_timestamps() {
        let mut engine = engine(SyncMode::Enabled);
        let sent = engine
            .send(vec![
                Change::new(Dataset::Transactions, "t1", "amount", -500),
                Change::new(Dataset::Transactions, "t1", "notes", "lunch"),
            ])
            .unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].timestamp < sent[1].timestamp);
        assert_eq!(sent[0].timestamp.millis(), fixed_time());
        assert_eq!(engine.clock().last_timestamp(), sent[1].timestamp);
        assert_eq!(engine.store().message_count().unwrap(), 2);
    }

    #[test]
    fn set_mode_returns_previous() {
        let mut engine = engine(SyncMode::Disabled);
        assert_eq!(engine.set_mode(SyncMode::Offline), SyncMode::Disabled);
        assert!(engine.is_active(SyncMode::Enabled));
        assert!(engine.is_active(SyncMode::Offline));
        assert_eq!(engine.set_mode(SyncMode::Import), SyncMode::Offline);
        assert!(engine.is_active(SyncMode::Disabled));
    }

    #[test]
    fn failed_batch_leaves_state_untouched() {
        let mut engine = engine(SyncMode::Enabled);
        engine.send(vec![Change::new(Dataset::Notes, "n1", "note", "a")]).unwrap();
        let clock_before = engine.clock().last_timestamp();
        let trie_before = engine.trie().clone();

        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        engine.subscribe_events(move |event| {
            if let SyncEvent::Error { kind, .. } = event {
                seen.lock().unwrap().push(*kind);
            }
        });

        engine.store_mut().fail_writes_to(Dataset::Notes, "n2");
        let err = engine
            .send(vec![
                Change::new(Dataset::Notes, "n1", "note", "b"),
                Change::new(Dataset::Notes, "n2", "note", "c"),
            ])
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-schema");
        assert_eq!(engine.clock().last_timestamp(), clock_before);
        assert_eq!(engine.trie(), &trie_before);
        assert_eq!(
            engine.store().field(Dataset::Notes, "n1", "note"),
            Some(&Value::from("a"))
        );
        assert_eq!(*errors.lock().unwrap(), vec!["invalid-schema"]);
    }

    #[test]
    fn listeners_see_before_and_after() {
        let mut engine = engine(SyncMode::Enabled);
        engine.send(vec![Change::new(Dataset::Payees, "p1", "name", "Old")]).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = engine.add_sync_listener(move |old, new| {
            let name = |s: &Snapshot| {
                s.get(Dataset::Payees, "p1")
                    .and_then(|row| row.get("name"))
                    .cloned()
            };
            assert_eq!(name(old), Some(Value::from("Old")));
            assert_eq!(name(new), Some(Value::from("New")));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        engine.send(vec![Change::new(Dataset::Payees, "p1", "name", "New")]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(engine.remove_sync_listener(id));
        engine.send(vec![Change::new(Dataset::Payees, "p1", "name", "Newer")]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut engine = engine(SyncMode::Enabled);
        let sent = engine.batch(|_| {}).unwrap();
        assert!(sent.is_empty());
        assert_eq!(engine.clock().last_timestamp().millis(), 0);
    }
}
