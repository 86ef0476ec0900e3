//! SQLite persistence backend using rusqlite.
//!
//! Each dataset gets its own table with an `id` key and one untyped column
//! per field. The message log lives in `messages_crdt` and the clock record
//! in the single-row `messages_clock` table.
//!
//! # Example
//!
//! ```no_run
//! use ledger_crdt::{Dataset, Value};
//! use ledger_store::{RowStore, SqliteStore};
//!
//! let mut store = SqliteStore::open("budget.sqlite").unwrap();
//! store
//!     .insert_row(Dataset::Accounts, "a1", "name", &Value::from("Checking"))
//!     .unwrap();
//! assert!(store.row_exists(Dataset::Accounts, "a1").unwrap());
//! ```

use std::path::Path;
use std::sync::Mutex;

use ledger_crdt::{Dataset, Message, Timestamp, Value};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};

use crate::traits::{ClockStore, MessageLog, Row, RowStore, TransactionError, Transactional};

/// SQLite configuration options.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// SQLite journal mode. Defaults to WAL.
    pub journal_mode: JournalMode,
    /// Busy timeout in milliseconds. Defaults to 5000.
    pub busy_timeout_ms: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5000,
        }
    }
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Write-Ahead Logging; readers are not blocked by the writer.
    Wal,
    /// Traditional rollback journal.
    Delete,
    /// In-memory journal (fastest, no crash recovery).
    Memory,
}

impl JournalMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

/// Error type for the SQLite backend.
#[derive(Debug, thiserror::Error)]
pub enum SqliteError {
    /// An error from rusqlite.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Lock poisoned.
    #[error("sqlite lock poisoned")]
    LockPoisoned,
    /// The dataset is not backed by a table.
    #[error("dataset {0} has no table")]
    NoTable(Dataset),
    /// The column is not part of the dataset's table.
    #[error("no column {column:?} in {dataset}")]
    UnknownColumn {
        /// Dataset written to.
        dataset: Dataset,
        /// Rejected column.
        column: String,
    },
    /// A logged message could not be decoded.
    #[error("corrupt log entry at {timestamp}: {reason}")]
    CorruptLog {
        /// Timestamp column of the entry.
        timestamp: String,
        /// What failed to decode.
        reason: String,
    },
}

/// SQLite persistence backend.
///
/// Wraps a `rusqlite::Connection` behind a `Mutex` for safe shared access.
/// Creates the schema automatically on first open.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    /// Number of open (possibly nested) transactions.
    depth: usize,
}

struct SqlValue<'a>(&'a Value);

impl ToSql for SqlValue<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Number(n) => ToSqlOutput::Borrowed(ValueRef::Real(*n)),
            Value::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn value_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i as f64),
        ValueRef::Real(f) => Value::Number(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

fn checked_column(dataset: Dataset, column: &str) -> Result<(), SqliteError> {
    if dataset.is_prefs() {
        return Err(SqliteError::NoTable(dataset));
    }
    if !dataset.has_column(column) {
        return Err(SqliteError::UnknownColumn {
            dataset,
            column: column.to_string(),
        });
    }
    Ok(())
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path with default config.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SqliteError> {
        Self::open_with_config(path, SqliteConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: SqliteConfig,
    ) -> Result<Self, SqliteError> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn, &config)?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            depth: 0,
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, SqliteError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(
            &conn,
            &SqliteConfig {
                journal_mode: JournalMode::Memory,
                ..SqliteConfig::default()
            },
        )?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            depth: 0,
        })
    }

    fn init_connection(conn: &Connection, config: &SqliteConfig) -> Result<(), SqliteError> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA busy_timeout = {};
             PRAGMA synchronous = NORMAL;",
            config.journal_mode.as_str(),
            config.busy_timeout_ms,
        ))?;
        Ok(())
    }

    fn create_schema(conn: &Connection) -> Result<(), SqliteError> {
        let mut ddl = String::from(
            "CREATE TABLE IF NOT EXISTS messages_crdt (
                id          INTEGER PRIMARY KEY,
                timestamp   TEXT NOT NULL UNIQUE,
                dataset     TEXT NOT NULL,
                row         TEXT NOT NULL,
                column      TEXT NOT NULL,
                value       TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS messages_crdt_search
                ON messages_crdt(dataset, row, column, timestamp);

            CREATE TABLE IF NOT EXISTS messages_clock (
                id          INTEGER PRIMARY KEY,
                clock       TEXT NOT NULL
            );",
        );
        for dataset in Dataset::tables() {
            let columns: Vec<String> = dataset
                .columns()
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect();
            ddl.push_str(&format!(
                "\nCREATE TABLE IF NOT EXISTS \"{}\" (id TEXT PRIMARY KEY, {});",
                dataset.name(),
                columns.join(", ")
            ));
        }
        conn.execute_batch(&ddl)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SqliteError> {
        self.conn.lock().map_err(|_| SqliteError::LockPoisoned)
    }

    /// Get the database file size in bytes (0 for in-memory).
    pub fn file_size(&self) -> Result<u64, SqliteError> {
        let conn = self.lock()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok((page_count * page_size) as u64)
    }

    /// Get the current journal mode.
    pub fn journal_mode(&self) -> Result<String, SqliteError> {
        let conn = self.lock()?;
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        Ok(mode)
    }

    fn decode_message(
        timestamp: String,
        dataset: String,
        row: String,
        column: String,
        value: String,
    ) -> Result<Message, SqliteError> {
        let corrupt = |reason: String| SqliteError::CorruptLog {
            timestamp: timestamp.clone(),
            reason,
        };
        let dataset = dataset
            .parse::<Dataset>()
            .map_err(|e| corrupt(e.to_string()))?;
        let value = Value::decode(&value).map_err(|e| corrupt(e.to_string()))?;
        let ts = Timestamp::parse(&timestamp).map_err(|e| corrupt(e.to_string()))?;
        Ok(Message::new(dataset, row, column, value, ts))
    }
}

impl RowStore for SqliteStore {
    type Error = SqliteError;

    fn fetch_rows(&self, dataset: Dataset, ids: &[&str]) -> Result<Vec<(String, Row)>, Self::Error> {
        if dataset.is_prefs() {
            return Err(SqliteError::NoTable(dataset));
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM \"{}\" WHERE id IN ({placeholders})",
            dataset.name()
        ))?;
        let names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |r| {
                let id: String = r.get(0)?;
                let mut row = Row::new();
                for (i, name) in names.iter().enumerate().skip(1) {
                    let value = value_from_sql(r.get_ref(i)?);
                    if !value.is_null() {
                        row.insert(name.clone(), value);
                    }
                }
                Ok((id, row))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_exists(&self, dataset: Dataset, id: &str) -> Result<bool, Self::Error> {
        if dataset.is_prefs() {
            return Ok(false);
        }
        let conn = self.lock()?;
        let found = conn
            .query_row(
                &format!("SELECT 1 FROM \"{}\" WHERE id = ?1", dataset.name()),
                params![id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_row(
        &mut self,
        dataset: Dataset,
        id: &str,
        column: &str,
        value: &Value,
    ) -> Result<(), Self::Error> {
        checked_column(dataset, column)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO \"{}\" (id, \"{column}\") VALUES (?1, ?2)",
                dataset.name()
            ),
            params![id, SqlValue(value)],
        )?;
        Ok(())
    }

    fn update_row(
        &mut self,
        dataset: Dataset,
        id: &str,
        column: &str,
        value: &Value,
    ) -> Result<(), Self::Error> {
        checked_column(dataset, column)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO \"{}\" (id, \"{column}\") VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET \"{column}\" = excluded.\"{column}\"",
                dataset.name()
            ),
            params![id, SqlValue(value)],
        )?;
        Ok(())
    }

    fn row_count(&self, dataset: Dataset) -> Result<u64, Self::Error> {
        if dataset.is_prefs() {
            return Ok(0);
        }
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", dataset.name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

impl MessageLog for SqliteStore {
    fn latest_at_or_after(
        &self,
        dataset: Dataset,
        row: &str,
        column: &str,
        since: &Timestamp,
    ) -> Result<Option<Timestamp>, Self::Error> {
        let conn = self.lock()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT timestamp FROM messages_crdt
                 WHERE dataset = ?1 AND row = ?2 AND column = ?3 AND timestamp >= ?4
                 ORDER BY timestamp DESC LIMIT 1",
                params![dataset.name(), row, column, since.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        found
            .map(|s| {
                Timestamp::parse(&s).map_err(|e| SqliteError::CorruptLog {
                    timestamp: s.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn append_message(&mut self, message: &Message) -> Result<(), Self::Error> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO messages_crdt (timestamp, dataset, row, column, value)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.timestamp.to_string(),
                message.dataset.name(),
                message.row,
                message.column,
                message.value.encode(),
            ],
        )?;
        Ok(())
    }

    fn messages_since(&self, since: &Timestamp) -> Result<Vec<Message>, Self::Error> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, dataset, row, column, value FROM messages_crdt
             WHERE timestamp > ?1 ORDER BY timestamp",
        )?;
        let raw = stmt
            .query_map(params![since.to_string()], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })?
            .collect::<Result<Vec<(String, String, String, String, String)>, _>>()?;
        raw.into_iter()
            .map(|(ts, dataset, row, column, value)| {
                Self::decode_message(ts, dataset, row, column, value)
            })
            .collect()
    }

    fn message_count(&self) -> Result<u64, Self::Error> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages_crdt", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    fn all_timestamps(&self) -> Result<Vec<Timestamp>, Self::Error> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT timestamp FROM messages_crdt ORDER BY timestamp")?;
        let raw = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|s| {
                Timestamp::parse(&s).map_err(|e| SqliteError::CorruptLog {
                    timestamp: s.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

impl ClockStore for SqliteStore {
    fn load_clock(&self) -> Result<Option<String>, Self::Error> {
        let conn = self.lock()?;
        let clock = conn
            .query_row("SELECT clock FROM messages_clock WHERE id = 1", [], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(clock)
    }

    fn save_clock(&mut self, record: &str) -> Result<(), Self::Error> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO messages_clock (id, clock) VALUES (1, ?1)",
            params![record],
        )?;
        Ok(())
    }
}

impl Transactional for SqliteStore {
    fn transaction<F, R, E>(&mut self, f: F) -> Result<R, TransactionError<Self::Error, E>>
    where
        F: FnOnce(&mut Self) -> Result<R, E>,
    {
        let savepoint = format!("ledger_tx_{}", self.depth);
        {
            let conn = self.lock().map_err(TransactionError::Store)?;
            conn.execute_batch(&format!("SAVEPOINT {savepoint}"))
                .map_err(|e| TransactionError::Store(e.into()))?;
        }
        self.depth += 1;
        let outcome = f(self);
        self.depth -= 1;

        let conn = self.lock().map_err(TransactionError::Store)?;
        match outcome {
            Ok(result) => {
                conn.execute_batch(&format!("RELEASE {savepoint}"))
                    .map_err(|e| TransactionError::Store(e.into()))?;
                Ok(result)
            }
            Err(e) => {
                conn.execute_batch(&format!("ROLLBACK TO {savepoint}; RELEASE {savepoint}"))
                    .map_err(|e| TransactionError::Store(e.into()))?;
                Err(TransactionError::Aborted(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_crdt::NodeId;

    fn test_store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn ts(millis: u64) -> Timestamp {
        Timestamp::new(millis, 0, NodeId::new("A").unwrap())
    }

    #[test]
    fn creates_a_table_per_dataset() {
        let store = test_store();
        for dataset in Dataset::tables() {
            assert_eq!(store.row_count(dataset).unwrap(), 0);
        }
    }

    #[test]
    fn row_insert_update_fetch() {
        let mut store = test_store();
        store
            .insert_row(Dataset::Transactions, "t1", "amount", &Value::from(-500))
            .unwrap();
        store
            .update_row(Dataset::Transactions, "t1", "notes", &Value::from("rent"))
            .unwrap();

        let rows = store
            .fetch_rows(Dataset::Transactions, &["t1", "missing"])
            .unwrap();
        assert_eq!(rows.len(), 1);
        let (id, row) = &rows[0];
        assert_eq!(id, "t1");
        assert_eq!(row["amount"], Value::Number(-500.0));
        assert_eq!(row["notes"], Value::from("rent"));
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn unknown_columns_are_rejected() {
        let mut store = test_store();
        let err = store
            .insert_row(Dataset::Transactions, "t1", "amount; DROP TABLE x", &Value::Null)
            .unwrap_err();
        assert!(matches!(err, SqliteError::UnknownColumn { .. }));
        assert!(matches!(
            store.update_row(Dataset::Prefs, "k", "v", &Value::Null),
            Err(SqliteError::NoTable(Dataset::Prefs))
        ));
    }

    #[test]
    fn log_round_trips_values() {
        let mut store = test_store();
        let messages = [
            Message::new(Dataset::Transactions, "t1", "amount", -500, ts(10)),
            Message::new(Dataset::Transactions, "t1", "notes", "S:tricky", ts(20)),
            Message::new(Dataset::Transactions, "t1", "notes", Value::Null, ts(30)),
        ];
        for m in &messages {
            store.append_message(m).unwrap();
        }
        store.append_message(&messages[0]).unwrap();

        assert_eq!(store.message_count().unwrap(), 3);
        assert_eq!(store.messages_since(&ts(0)).unwrap(), messages.to_vec());
        assert_eq!(store.messages_since(&ts(20)).unwrap(), messages[2..].to_vec());
        assert_eq!(
            store
                .latest_at_or_after(Dataset::Transactions, "t1", "notes", &ts(15))
                .unwrap(),
            Some(ts(30))
        );
        assert_eq!(
            store
                .latest_at_or_after(Dataset::Transactions, "t1", "amount", &ts(11))
                .unwrap(),
            None
        );
    }

    #[test]
    fn clock_record_is_single_row() {
        let mut store = test_store();
        assert_eq!(store.load_clock().unwrap(), None);
        store.save_clock("{\"a\":1}").unwrap();
        store.save_clock("{\"a\":2}").unwrap();
        assert_eq!(store.load_clock().unwrap().as_deref(), Some("{\"a\":2}"));
    }

    #[test]
    fn transaction_commit_and_rollback() {
        let mut store = test_store();
        store
            .transaction(|s| {
                s.insert_row(Dataset::Banks, "b1", "name", &Value::from("kept"))?;
                let inner: Result<(), _> = s.transaction(|s| {
                    s.insert_row(Dataset::Banks, "b2", "name", &Value::from("dropped"))?;
                    Err(SqliteError::NoTable(Dataset::Prefs))
                });
                assert!(matches!(inner, Err(TransactionError::Aborted(_))));
                Ok::<_, SqliteError>(())
            })
            .unwrap();
        assert!(store.row_exists(Dataset::Banks, "b1").unwrap());
        assert!(!store.row_exists(Dataset::Banks, "b2").unwrap());

        let failed: Result<(), _> = store.transaction(|s| {
            s.append_message(&Message::new(Dataset::Banks, "b3", "name", "x", ts(1)))?;
            s.save_clock("never")?;
            Err(SqliteError::LockPoisoned)
        });
        assert!(failed.is_err());
        assert_eq!(store.message_count().unwrap(), 0);
        assert_eq!(store.load_clock().unwrap(), None);
    }

    #[test]
    fn reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("budget.sqlite");
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.save_clock("persisted").unwrap();
            store
                .append_message(&Message::new(Dataset::Notes, "n1", "note", "hi", ts(5)))
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_clock().unwrap().as_deref(), Some("persisted"));
        assert_eq!(store.all_timestamps().unwrap(), vec![ts(5)]);
        assert_eq!(store.journal_mode().unwrap().to_lowercase(), "wal");
    }
}
