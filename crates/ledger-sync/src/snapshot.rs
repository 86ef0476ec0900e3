//! Row snapshots taken around a batch.

use std::collections::{BTreeMap, BTreeSet};

use ledger_crdt::{Dataset, Message};
use ledger_store::{Row, RowStore};

/// Copies of the rows a batch touches, keyed by dataset and row id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    tables: BTreeMap<Dataset, BTreeMap<String, Row>>,
}

impl Snapshot {
    /// The copy of one row, if it existed.
    pub fn get(&self, dataset: Dataset, id: &str) -> Option<&Row> {
        self.tables.get(&dataset)?.get(id)
    }

    /// Whether the row existed.
    pub fn contains(&self, dataset: Dataset, id: &str) -> bool {
        self.get(dataset, id).is_some()
    }

    /// Rows of one dataset.
    pub fn table(&self, dataset: Dataset) -> impl Iterator<Item = (&str, &Row)> {
        self.tables
            .get(&dataset)
            .into_iter()
            .flat_map(|rows| rows.iter().map(|(id, row)| (id.as_str(), row)))
    }

    /// Datasets with at least one row.
    pub fn datasets(&self) -> impl Iterator<Item = Dataset> + '_ {
        self.tables.keys().copied()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(BTreeMap::is_empty)
    }
}

/// Row ids touched by a batch, per dataset. Preferences are not rows.
pub(crate) fn touched_rows(messages: &[Message]) -> BTreeMap<Dataset, BTreeSet<&str>> {
    let mut touched: BTreeMap<Dataset, BTreeSet<&str>> = BTreeMap::new();
    for msg in messages.iter().filter(|m| !m.dataset.is_prefs()) {
        touched.entry(msg.dataset).or_default().insert(&msg.row);
    }
    touched
}

/// Fetch every touched row, `chunk_size` ids per query.
pub(crate) fn fetch<S: RowStore>(
    store: &S,
    touched: &BTreeMap<Dataset, BTreeSet<&str>>,
    chunk_size: usize,
) -> Result<Snapshot, S::Error> {
    let mut snapshot = Snapshot::default();
    for (dataset, ids) in touched {
        let ids: Vec<&str> = ids.iter().copied().collect();
        for chunk in ids.chunks(chunk_size.max(1)) {
            for (id, row) in store.fetch_rows(*dataset, chunk)? {
                snapshot.tables.entry(*dataset).or_default().insert(id, row);
            }
        }
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_crdt::{NodeId, Timestamp, Value};
    use ledger_store::MemoryStore;

    #[test]
    fn fetches_in_chunks() {
        let mut store = MemoryStore::new();
        let ts = Timestamp::new(1, 0, NodeId::new("A").unwrap());
        let mut messages = Vec::new();
        for i in 0..7 {
            let id = format!("t{i}");
            if i % 2 == 0 {
                store
                    .insert_row(Dataset::Transactions, &id, "amount", &Value::from(i))
                    .unwrap();
            }
            messages.push(Message::new(Dataset::Transactions, id, "amount", i, ts));
        }
        messages.push(Message::new(Dataset::Prefs, "budgetType", "value", "rollover", ts));

        let touched = touched_rows(&messages);
        assert_eq!(touched.len(), 1);

        let snapshot = fetch(&store, &touched, 3).unwrap();
        assert_eq!(snapshot.table(Dataset::Transactions).count(), 4);
        assert!(snapshot.contains(Dataset::Transactions, "t6"));
        assert!(!snapshot.contains(Dataset::Transactions, "t1"));
        assert_eq!(snapshot.datasets().collect::<Vec<_>>(), vec![Dataset::Transactions]);
    }
}
