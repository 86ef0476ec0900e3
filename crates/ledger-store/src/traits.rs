use std::collections::BTreeMap;

use ledger_crdt::{Dataset, Message, Timestamp, Value};

/// The non-null fields of one row, by column name.
pub type Row = BTreeMap<String, Value>;

/// Table storage for replicated rows.
///
/// Rows are addressed by `(dataset, id)` and written one column at a time,
/// matching how change messages arrive.
pub trait RowStore {
    /// Error type for this backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the rows with the given ids. Missing ids are skipped.
    fn fetch_rows(&self, dataset: Dataset, ids: &[&str]) -> Result<Vec<(String, Row)>, Self::Error>;

    /// Whether a row with this id exists.
    fn row_exists(&self, dataset: Dataset, id: &str) -> Result<bool, Self::Error>;

    /// Create a row holding just `column`.
    ///
    /// An existing row with the same id is replaced, not merged: its other
    /// columns are dropped. Callers that want to keep them use
    /// [`update_row`](RowStore::update_row).
    fn insert_row(
        &mut self,
        dataset: Dataset,
        id: &str,
        column: &str,
        value: &Value,
    ) -> Result<(), Self::Error>;

    /// Set one column of an existing row.
    fn update_row(
        &mut self,
        dataset: Dataset,
        id: &str,
        column: &str,
        value: &Value,
    ) -> Result<(), Self::Error>;

    /// Number of rows in a dataset.
    fn row_count(&self, dataset: Dataset) -> Result<u64, Self::Error>;

    /// Datasets this store keeps tables for.
    fn datasets(&self) -> Vec<Dataset> {
        Dataset::tables().collect()
    }
}

/// Append-only log of every applied message.
pub trait MessageLog: RowStore {
    /// Greatest logged timestamp `>= since` for the same field, if any.
    fn latest_at_or_after(
        &self,
        dataset: Dataset,
        row: &str,
        column: &str,
        since: &Timestamp,
    ) -> Result<Option<Timestamp>, Self::Error>;

    /// Append a message. Appending a timestamp that is already logged is a
    /// no-op.
    fn append_message(&mut self, message: &Message) -> Result<(), Self::Error>;

    /// Messages with a timestamp strictly greater than `since`, ascending.
    fn messages_since(&self, since: &Timestamp) -> Result<Vec<Message>, Self::Error>;

    /// Number of logged messages.
    fn message_count(&self) -> Result<u64, Self::Error>;

    /// Every logged timestamp, ascending.
    fn all_timestamps(&self) -> Result<Vec<Timestamp>, Self::Error>;
}

/// The single persisted clock record.
pub trait ClockStore: RowStore {
    /// Load the serialized record, if one was saved.
    fn load_clock(&self) -> Result<Option<String>, Self::Error>;

    /// Replace the serialized record.
    fn save_clock(&mut self, record: &str) -> Result<(), Self::Error>;
}

/// Failure of a [`Transactional::transaction`].
#[derive(Debug, thiserror::Error)]
pub enum TransactionError<S, E> {
    /// The store could not begin, commit or roll back.
    #[error("transaction failed: {0}")]
    Store(#[source] S),
    /// The closure returned an error; its changes were rolled back.
    #[error("transaction aborted: {0}")]
    Aborted(#[source] E),
}

/// Extension trait for backends that support atomic transactions.
pub trait Transactional: RowStore {
    /// Run `f` atomically: its writes commit when it returns `Ok` and are
    /// rolled back when it returns `Err`. Calls may nest; an inner rollback
    /// only undoes the inner closure's writes.
    fn transaction<F, R, E>(&mut self, f: F) -> Result<R, TransactionError<Self::Error, E>>
    where
        F: FnOnce(&mut Self) -> Result<R, E>;
}

/// Everything a replica needs from its storage.
pub trait ReplicaStore: MessageLog + ClockStore + Transactional {}

impl<T: MessageLog + ClockStore + Transactional> ReplicaStore for T {}
