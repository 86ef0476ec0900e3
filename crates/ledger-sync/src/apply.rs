//! The apply pipeline: dedup, order, apply atomically, then notify.

use std::collections::{BTreeMap, BTreeSet};

use ledger_crdt::message::applied_tables;
use ledger_crdt::{Dataset, Message, SyncMode, Value};
use ledger_store::{MessageLog, ReplicaStore, RowStore, TransactionError};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::listeners::{Hooks, SyncEvent};
use crate::replica::ReplicaState;
use crate::snapshot::{self, Snapshot};

/// A batch whose transaction has committed but whose collaborators have
/// not been notified yet.
#[derive(Debug)]
pub(crate) struct Committed {
    pub(crate) messages: Vec<Message>,
    before: Snapshot,
    notify: bool,
}

impl Committed {
    fn quiet(messages: Vec<Message>) -> Self {
        Self {
            messages,
            before: Snapshot::default(),
            notify: false,
        }
    }
}

/// Run one batch through the store transaction.
///
/// `working` is a copy of the replica state; its trie is updated in place
/// and must only be adopted when this returns `Ok`.
///
/// Preferences are handed to the [`PreferenceStore`](crate::PreferenceStore)
/// as the last step inside the transaction, so a failed save rolls the
/// whole batch back and a retry sees none of it logged.
pub(crate) fn commit<S: ReplicaStore>(
    store: &mut S,
    working: &mut ReplicaState,
    mode: SyncMode,
    config: &SyncConfig,
    hooks: &Hooks,
    messages: Vec<Message>,
) -> Result<Committed, SyncError> {
    debug!(%mode, messages = messages.len(), "applying batch");

    if mode == SyncMode::Import {
        apply_import(store, &messages)?;
        return Ok(Committed::quiet(messages));
    }

    let history = mode.keeps_history();
    let mut messages = if history {
        dedup(store, messages)?
    } else {
        messages
    };
    messages.sort_by_key(|m| m.timestamp);

    let touched = snapshot::touched_rows(&messages);
    let before =
        snapshot::fetch(store, &touched, config.fetch_chunk_size).map_err(SyncError::store)?;
    if let Some(undo) = &hooks.undo {
        undo.append_messages(&messages, &before);
    }

    let result = store.transaction(|tx| -> Result<_, SyncError> {
        let mut added: BTreeSet<(Dataset, &str)> = BTreeSet::new();
        let mut prefs = BTreeMap::new();
        let mut trie = working.trie.clone();

        for msg in &messages {
            if !msg.old {
                apply_one(tx, msg, &before, &mut added, &mut prefs)?;
            }
            if history {
                tx.append_message(msg).map_err(SyncError::store)?;
                trie = trie.insert(&msg.timestamp);
            }
        }

        if history {
            trie = trie.prune(config.prune_keep);
            if let Some(horizon) = config.prune_horizon {
                trie = trie.prune_before(horizon.millis());
            }
            working.trie = trie;
            tx.save_clock(&working.record()?).map_err(SyncError::store)?;
        }
        if !prefs.is_empty() {
            hooks.prefs.save_prefs(&prefs).map_err(SyncError::Store)?;
        }
        Ok(prefs.len())
    });

    let prefs = result.map_err(|e| {
        let e = match e {
            TransactionError::Store(e) => SyncError::store(e),
            TransactionError::Aborted(e) => e,
        };
        warn!(error = %e, "batch rolled back");
        e
    })?;

    debug!(messages = messages.len(), prefs, "batch committed");
    Ok(Committed {
        messages,
        before,
        notify: true,
    })
}

fn apply_one<'m, S: RowStore>(
    tx: &mut S,
    msg: &'m Message,
    before: &Snapshot,
    added: &mut BTreeSet<(Dataset, &'m str)>,
    prefs: &mut BTreeMap<String, Value>,
) -> Result<(), SyncError> {
    if msg.dataset.is_prefs() {
        prefs.insert(msg.row.clone(), msg.value.clone());
        return Ok(());
    }
    let key = (msg.dataset, msg.row.as_str());
    let written = if before.contains(msg.dataset, &msg.row) || added.contains(&key) {
        tx.update_row(msg.dataset, &msg.row, &msg.column, &msg.value)
    } else {
        added.insert(key);
        tx.insert_row(msg.dataset, &msg.row, &msg.column, &msg.value)
    };
    written.map_err(|e| SyncError::schema(msg.dataset, &msg.column, e))
}

/// Drop duplicates and flag messages superseded by the log.
fn dedup<S: MessageLog>(store: &S, messages: Vec<Message>) -> Result<Vec<Message>, SyncError> {
    let total = messages.len();
    let mut seen = BTreeSet::new();
    let mut kept = Vec::with_capacity(total);
    for mut msg in messages {
        if !seen.insert(msg.timestamp) {
            continue;
        }
        let latest = store
            .latest_at_or_after(msg.dataset, &msg.row, &msg.column, &msg.timestamp)
            .map_err(SyncError::store)?;
        match latest {
            None => msg.old = false,
            Some(ts) if ts == msg.timestamp => continue,
            Some(_) => msg.old = true,
        }
        kept.push(msg);
    }
    let old = kept.iter().filter(|m| m.old).count();
    debug!(dropped = total - kept.len(), old, "deduplicated batch");
    Ok(kept)
}

/// Import fast path: rows only, no bookkeeping.
fn apply_import<S: ReplicaStore>(store: &mut S, messages: &[Message]) -> Result<(), SyncError> {
    let result = store.transaction(|tx| -> Result<(), SyncError> {
        let mut added: BTreeSet<(Dataset, &str)> = BTreeSet::new();
        for msg in messages.iter().filter(|m| !m.old) {
            if msg.dataset.is_prefs() {
                return Err(SyncError::ModeViolation);
            }
            let key = (msg.dataset, msg.row.as_str());
            let exists = added.contains(&key)
                || tx
                    .row_exists(msg.dataset, &msg.row)
                    .map_err(SyncError::store)?;
            let written = if exists {
                tx.update_row(msg.dataset, &msg.row, &msg.column, &msg.value)
            } else {
                added.insert(key);
                tx.insert_row(msg.dataset, &msg.row, &msg.column, &msg.value)
            };
            written.map_err(|e| SyncError::schema(msg.dataset, &msg.column, e))?;
        }
        Ok(())
    });
    result.map_err(|e| match e {
        TransactionError::Store(e) => SyncError::store(e),
        TransactionError::Aborted(e) => e,
    })
}

/// Post-commit work: the reactive layer, sync listeners and the `Applied`
/// event.
///
/// The batch is already durable here, so nothing in this step fails the
/// call. A snapshot that cannot be read is reported as [`SyncEvent::Error`].
pub(crate) fn notify<S: RowStore>(
    store: &S,
    config: &SyncConfig,
    hooks: &Hooks,
    committed: &Committed,
) {
    if !committed.notify {
        return;
    }

    let touched = snapshot::touched_rows(&committed.messages);
    let after = match snapshot::fetch(store, &touched, config.fetch_chunk_size) {
        Ok(after) => after,
        Err(e) => {
            let e = SyncError::store(e);
            warn!(error = %e, "could not read rows after commit; listeners skipped");
            hooks.emit(&SyncEvent::Error {
                kind: e.kind(),
                message: e.to_string(),
            });
            return;
        }
    };

    if let Some(observer) = &hooks.observer {
        observer.on_changes_applied(&committed.before, &after);
    }
    for listener in hooks.sync_listeners.callbacks() {
        listener(&committed.before, &after);
    }
    hooks.emit(&SyncEvent::Applied {
        tables: applied_tables(&committed.messages),
    });
}
