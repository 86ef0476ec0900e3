//! Replicas that see the same messages end in the same state, whatever the
//! delivery order, batching or duplication.

use std::collections::BTreeMap;

use ledger_crdt::{Dataset, Message, NodeId, SyncMode, Timestamp, Value};
use ledger_store::MemoryStore;
use ledger_sync::SyncEngine;
use proptest::collection::vec;
use proptest::prelude::*;

const T0: u64 = 1_700_000_000_000;
const NODES: [&str; 3] = ["A", "B", "C"];
const COLUMNS: [&str; 2] = ["amount", "notes"];

fn now() -> u64 {
    T0
}

fn replica() -> SyncEngine<MemoryStore> {
    SyncEngine::builder(MemoryStore::new())
        .mode(SyncMode::Enabled)
        .time_source(now)
        .build()
        .unwrap()
}

fn messages() -> impl Strategy<Value = Vec<Message>> {
    vec((0u64..50, 0usize..3, 0usize..4, 0usize..2, -1000i32..1000), 1..40).prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (offset, node, row, column, value))| {
                let node = NodeId::new(NODES[node]).unwrap();
                let ts = Timestamp::new(T0 - 10_000 + offset, i as u16, node);
                Message::new(Dataset::Transactions, format!("t{row}"), COLUMNS[column], value, ts)
            })
            .collect()
    })
}

fn deliveries() -> impl Strategy<Value = (Vec<Message>, Vec<Message>, usize)> {
    messages().prop_flat_map(|msgs| (Just(msgs.clone()), Just(msgs).prop_shuffle(), 1usize..8))
}

/// Value of the write with the greatest timestamp, per field.
fn last_writes(messages: &[Message]) -> BTreeMap<(String, String), Value> {
    let mut latest: BTreeMap<(String, String), &Message> = BTreeMap::new();
    for msg in messages {
        let key = (msg.row.clone(), msg.column.clone());
        match latest.get(&key) {
            Some(seen) if seen.timestamp > msg.timestamp => {}
            _ => {
                latest.insert(key, msg);
            }
        }
    }
    latest
        .into_iter()
        .map(|(key, msg)| (key, msg.value.clone()))
        .collect()
}

proptest! {
    #[test]
    fn delivery_order_does_not_matter((msgs, shuffled, chunk) in deliveries()) {
        let mut a = replica();
        a.receive(msgs.clone()).unwrap();

        let mut b = replica();
        for batch in shuffled.chunks(chunk) {
            b.receive(batch.to_vec()).unwrap();
        }
        // Redelivery of an arbitrary batch.
        b.receive(shuffled[..chunk.min(shuffled.len())].to_vec()).unwrap();

        prop_assert_eq!(a.trie(), b.trie());
        prop_assert_eq!(a.trie().count(), msgs.len() as u64);

        for ((row, column), value) in last_writes(&msgs) {
            let in_a = a.store().field(Dataset::Transactions, &row, &column);
            let in_b = b.store().field(Dataset::Transactions, &row, &column);
            prop_assert_eq!(in_a, Some(&value));
            prop_assert_eq!(in_b, Some(&value));
        }
    }

    #[test]
    fn rebuilt_trie_matches_incremental_one(msgs in messages()) {
        let mut engine = replica();
        for msg in msgs {
            engine.receive(vec![msg]).unwrap();
        }
        prop_assert!(engine.verify_trie().unwrap().matches());
    }
}
