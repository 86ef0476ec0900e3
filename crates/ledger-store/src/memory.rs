use std::collections::{BTreeMap, BTreeSet};

use ledger_crdt::{Dataset, Message, Timestamp, Value};

use crate::traits::{ClockStore, MessageLog, Row, RowStore, TransactionError, Transactional};

/// In-memory storage backend.
///
/// All data is stored in `BTreeMap`s and nothing touches disk, which makes
/// it the backend of choice for tests.
///
/// # Example
///
/// ```
/// use ledger_crdt::{Dataset, Value};
/// use ledger_store::{MemoryStore, RowStore};
///
/// let mut store = MemoryStore::new();
/// store
///     .insert_row(Dataset::Transactions, "t1", "amount", &Value::from(-500))
///     .unwrap();
///
/// let rows = store.fetch_rows(Dataset::Transactions, &["t1"]).unwrap();
/// assert_eq!(rows[0].1["amount"], Value::from(-500));
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Data,
    /// State saved at the start of each open transaction.
    savepoints: Vec<Data>,
    /// Reject columns that are not part of the dataset.
    strict: bool,
    /// Rows whose writes fail.
    failing_rows: BTreeSet<(Dataset, String)>,
}

#[derive(Debug, Clone, Default)]
struct Data {
    tables: BTreeMap<Dataset, BTreeMap<String, Row>>,
    log: BTreeMap<Timestamp, Message>,
    clock: Option<String>,
}

/// Error type for the in-memory backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// The dataset is not backed by a table.
    #[error("dataset {0} has no table")]
    NoTable(Dataset),
    /// Strict mode rejected a column.
    #[error("no column {column:?} in {dataset}")]
    UnknownColumn {
        /// Dataset written to.
        dataset: Dataset,
        /// Rejected column.
        column: String,
    },
    /// A write failure injected with [`MemoryStore::fail_writes_to`].
    #[error("write to {dataset}/{row} failed")]
    Injected {
        /// Dataset written to.
        dataset: Dataset,
        /// Row written to.
        row: String,
    },
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects unknown columns, like a real schema.
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    /// Make every write to `(dataset, row)` fail.
    pub fn fail_writes_to(&mut self, dataset: Dataset, row: &str) {
        self.failing_rows.insert((dataset, row.to_string()));
    }

    /// Stop failing writes.
    pub fn clear_failures(&mut self) {
        self.failing_rows.clear();
    }

    /// Look up a single row.
    pub fn row(&self, dataset: Dataset, id: &str) -> Option<&Row> {
        self.data.tables.get(&dataset)?.get(id)
    }

    /// Look up a single field.
    pub fn field(&self, dataset: Dataset, id: &str, column: &str) -> Option<&Value> {
        self.row(dataset, id)?.get(column)
    }

    fn check_write(&self, dataset: Dataset, id: &str, column: &str) -> Result<(), MemoryError> {
        if dataset.is_prefs() {
            return Err(MemoryError::NoTable(dataset));
        }
        if self.strict && !dataset.has_column(column) {
            return Err(MemoryError::UnknownColumn {
                dataset,
                column: column.to_string(),
            });
        }
        if self.failing_rows.contains(&(dataset, id.to_string())) {
            return Err(MemoryError::Injected {
                dataset,
                row: id.to_string(),
            });
        }
        Ok(())
    }

    fn write(&mut self, dataset: Dataset, id: &str, column: &str, value: &Value) {
        let row = self
            .data
            .tables
            .entry(dataset)
            .or_default()
            .entry(id.to_string())
            .or_default();
        if value.is_null() {
            row.remove(column);
        } else {
            row.insert(column.to_string(), value.clone());
        }
    }
}

impl RowStore for MemoryStore {
    type Error = MemoryError;

    fn fetch_rows(&self, dataset: Dataset, ids: &[&str]) -> Result<Vec<(String, Row)>, Self::Error> {
        let Some(table) = self.data.tables.get(&dataset) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| table.get(*id).map(|row| (id.to_string(), row.clone())))
            .collect())
    }

    fn row_exists(&self, dataset: Dataset, id: &str) -> Result<bool, Self::Error> {
        Ok(self.row(dataset, id).is_some())
    }

    fn insert_row(
        &mut self,
        dataset: Dataset,
        id: &str,
        column: &str,
        value: &Value,
    ) -> Result<(), Self::Error> {
        self.check_write(dataset, id, column)?;
        if let Some(table) = self.data.tables.get_mut(&dataset) {
            table.remove(id);
        }
        self.write(dataset, id, column, value);
        Ok(())
    }

    fn update_row(
        &mut self,
        dataset: Dataset,
        id: &str,
        column: &str,
        value: &Value,
    ) -> Result<(), Self::Error> {
        self.check_write(dataset, id, column)?;
        self.write(dataset, id, column, value);
        Ok(())
    }

    fn row_count(&self, dataset: Dataset) -> Result<u64, Self::Error> {
        Ok(self
            .data
            .tables
            .get(&dataset)
            .map_or(0, |table| table.len() as u64))
    }
}

impl MessageLog for MemoryStore {
    fn latest_at_or_after(
        &self,
        dataset: Dataset,
        row: &str,
        column: &str,
        since: &Timestamp,
    ) -> Result<Option<Timestamp>, Self::Error> {
        Ok(self
            .data
            .log
            .range(since..)
            .rev()
            .find(|(_, m)| m.field() == (dataset, row, column))
            .map(|(ts, _)| *ts))
    }

    fn append_message(&mut self, message: &Message) -> Result<(), Self::Error> {
        let mut logged = message.clone();
        logged.old = false;
        self.data.log.entry(message.timestamp).or_insert(logged);
        Ok(())
    }

    fn messages_since(&self, since: &Timestamp) -> Result<Vec<Message>, Self::Error> {
        use std::ops::Bound::{Excluded, Unbounded};
        Ok(self
            .data
            .log
            .range((Excluded(since), Unbounded))
            .map(|(_, m)| m.clone())
            .collect())
    }

    fn message_count(&self) -> Result<u64, Self::Error> {
        Ok(self.data.log.len() as u64)
    }

    fn all_timestamps(&self) -> Result<Vec<Timestamp>, Self::Error> {
        Ok(self.data.log.keys().copied().collect())
    }
}

impl ClockStore for MemoryStore {
    fn load_clock(&self) -> Result<Option<String>, Self::Error> {
        Ok(self.data.clock.clone())
    }

    fn save_clock(&mut self, record: &str) -> Result<(), Self::Error> {
        self.data.clock = Some(record.to_string());
        Ok(())
    }
}

impl Transactional for MemoryStore {
    fn transaction<F, R, E>(&mut self, f: F) -> Result<R, TransactionError<Self::Error, E>>
    where
        F: FnOnce(&mut Self) -> Result<R, E>,
    {
        self.savepoints.push(self.data.clone());
        match f(self) {
            Ok(result) => {
                self.savepoints.pop();
                Ok(result)
            }
            Err(e) => {
                if let Some(saved) = self.savepoints.pop() {
                    self.data = saved;
                }
                Err(TransactionError::Aborted(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_crdt::NodeId;

    fn ts(millis: u64) -> Timestamp {
        Timestamp::new(millis, 0, NodeId::new("A").unwrap())
    }

    fn msg(millis: u64, row: &str, amount: i64) -> Message {
        Message::new(Dataset::Transactions, row, "amount", amount, ts(millis))
    }

    #[test]
    fn insert_then_update_row() {
        let mut store = MemoryStore::new();
        store
            .insert_row(Dataset::Transactions, "t1", "amount", &Value::from(-500))
            .unwrap();
        store
            .update_row(Dataset::Transactions, "t1", "notes", &Value::from("rent"))
            .unwrap();

        let row = store.row(Dataset::Transactions, "t1").unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row["notes"], Value::from("rent"));
        assert!(store.row_exists(Dataset::Transactions, "t1").unwrap());
        assert!(!store.row_exists(Dataset::Payees, "t1").unwrap());
        assert_eq!(store.row_count(Dataset::Transactions).unwrap(), 1);
    }

    #[test]
    fn null_clears_a_field() {
        let mut store = MemoryStore::new();
        store
            .insert_row(Dataset::Notes, "n1", "note", &Value::from("x"))
            .unwrap();
        store
            .update_row(Dataset::Notes, "n1", "note", &Value::Null)
            .unwrap();
        assert!(store.field(Dataset::Notes, "n1", "note").is_none());
        assert!(store.row_exists(Dataset::Notes, "n1").unwrap());
    }

    #[test]
    fn fetch_skips_missing_ids() {
        let mut store = MemoryStore::new();
        store
            .insert_row(Dataset::Payees, "p1", "name", &Value::from("Shop"))
            .unwrap();
        let rows = store.fetch_rows(Dataset::Payees, &["p0", "p1"]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "p1");
    }

    #[test]
    fn strict_rejects_unknown_columns() {
        let mut store = MemoryStore::strict();
        let err = store
            .insert_row(Dataset::Transactions, "t1", "colour", &Value::Null)
            .unwrap_err();
        assert!(matches!(err, MemoryError::UnknownColumn { .. }));
        assert!(MemoryStore::new()
            .insert_row(Dataset::Transactions, "t1", "colour", &Value::Null)
            .is_ok());
    }

    #[test]
    fn prefs_have_no_table() {
        let mut store = MemoryStore::new();
        assert_eq!(
            store.update_row(Dataset::Prefs, "budget", "name", &Value::Null),
            Err(MemoryError::NoTable(Dataset::Prefs))
        );
    }

    #[test]
    fn log_queries() {
        let mut store = MemoryStore::new();
        store.append_message(&msg(30, "t1", -1)).unwrap();
        store.append_message(&msg(10, "t1", -2)).unwrap();
        store.append_message(&msg(20, "t2", -3)).unwrap();
        store.append_message(&msg(10, "t9", -9)).unwrap();

        assert_eq!(store.message_count().unwrap(), 3);
        assert_eq!(
            store
                .latest_at_or_after(Dataset::Transactions, "t1", "amount", &ts(10))
                .unwrap(),
            Some(ts(30))
        );
        assert_eq!(
            store
                .latest_at_or_after(Dataset::Transactions, "t2", "amount", &ts(21))
                .unwrap(),
            None
        );
        assert_eq!(
            store
                .latest_at_or_after(Dataset::Transactions, "t2", "notes", &ts(0))
                .unwrap(),
            None
        );

        let since: Vec<_> = store
            .messages_since(&ts(10))
            .unwrap()
            .into_iter()
            .map(|m| m.timestamp)
            .collect();
        assert_eq!(since, vec![ts(20), ts(30)]);
        assert_eq!(store.all_timestamps().unwrap(), vec![ts(10), ts(20), ts(30)]);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let mut store = MemoryStore::new();
        store.save_clock("before").unwrap();

        let result: Result<(), _> = store.transaction(|s| {
            s.insert_row(Dataset::Transactions, "t1", "amount", &Value::from(1))?;
            s.append_message(&msg(1, "t1", 1))?;
            s.save_clock("after")?;
            Err(MemoryError::NoTable(Dataset::Prefs))
        });

        assert!(matches!(result, Err(TransactionError::Aborted(_))));
        assert!(!store.row_exists(Dataset::Transactions, "t1").unwrap());
        assert_eq!(store.message_count().unwrap(), 0);
        assert_eq!(store.load_clock().unwrap().as_deref(), Some("before"));
    }

    #[test]
    fn nested_rollback_keeps_outer_writes() {
        let mut store = MemoryStore::new();
        store
            .transaction(|s| {
                s.insert_row(Dataset::Banks, "b1", "name", &Value::from("Outer"))?;
                let inner: Result<(), _> = s.transaction(|s| {
                    s.insert_row(Dataset::Banks, "b2", "name", &Value::from("Inner"))?;
                    Err(MemoryError::NoTable(Dataset::Prefs))
                });
                assert!(inner.is_err());
                Ok::<_, MemoryError>(())
            })
            .unwrap();

        assert!(store.row_exists(Dataset::Banks, "b1").unwrap());
        assert!(!store.row_exists(Dataset::Banks, "b2").unwrap());
    }

    #[test]
    fn injected_failures() {
        let mut store = MemoryStore::new();
        store.fail_writes_to(Dataset::Transactions, "t2");
        assert!(store
            .insert_row(Dataset::Transactions, "t1", "amount", &Value::from(1))
            .is_ok());
        assert!(matches!(
            store.insert_row(Dataset::Transactions, "t2", "amount", &Value::from(1)),
            Err(MemoryError::Injected { .. })
        ));
        store.clear_failures();
        assert!(store
            .insert_row(Dataset::Transactions, "t2", "amount", &Value::from(1))
            .is_ok());
    }
}
