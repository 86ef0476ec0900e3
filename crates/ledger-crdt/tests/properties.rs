//! Property tests for the clock and the merkle trie.

use std::cell::Cell;

use ledger_crdt::clock::{Clock, ClockError, NodeId, Timestamp};
use ledger_crdt::merkle::MerkleTrie;
use proptest::prelude::*;

thread_local! {
    static NOW: Cell<u64> = const { Cell::new(0) };
}

fn now() -> u64 {
    NOW.with(Cell::get)
}

const START: u64 = 1_600_000_000_000;

#[derive(Debug, Clone)]
enum Event {
    Tick(u64),
    Rewind(u64),
    Local,
    Remote { offset: i64, counter: u16 },
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        (0u64..5_000).prop_map(Event::Tick),
        (0u64..5_000).prop_map(Event::Rewind),
        Just(Event::Local),
        (-60_000i64..60_000, 0u16..100).prop_map(|(offset, counter)| Event::Remote { offset, counter }),
    ]
}

fn ts(millis: u64, node: &str) -> Timestamp {
    Timestamp::new(millis, 0, NodeId::new(node).unwrap())
}

proptest! {
    #[test]
    fn clock_never_goes_backward(events in prop::collection::vec(arb_event(), 1..200)) {
        NOW.with(|t| t.set(START));
        let mut clock = Clock::with_time_source(NodeId::new("A").unwrap(), now);
        let peer = NodeId::new("B").unwrap();
        let mut last = clock.last_timestamp();

        for event in events {
            let produced = match event {
                Event::Tick(ms) => { NOW.with(|t| t.set(t.get() + ms)); continue; }
                Event::Rewind(ms) => { NOW.with(|t| t.set(t.get() - ms)); continue; }
                Event::Local => clock.now(),
                Event::Remote { offset, counter } => {
                    let millis = (now() as i64 + offset) as u64;
                    let remote = Timestamp::new(millis, counter, peer);
                    let received = clock.recv(&remote);
                    if let Ok(next) = &received {
                        prop_assert!(*next > remote);
                    }
                    received
                }
            };
            match produced {
                Ok(next) => {
                    prop_assert!(next > last);
                    prop_assert_eq!(next.node(), clock.node());
                    last = next;
                }
                Err(ClockError::Drift { .. }) | Err(ClockError::Overflow) => {
                    prop_assert_eq!(clock.last_timestamp(), last);
                }
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }

    #[test]
    fn text_order_matches_value_order(
        a in (0u64..4_000_000_000_000, any::<u16>()),
        b in (0u64..4_000_000_000_000, any::<u16>()),
    ) {
        let node = NodeId::new("0123456789ABCDEF").unwrap();
        let x = Timestamp::new(a.0, a.1, node);
        let y = Timestamp::new(b.0, b.1, node);
        prop_assert_eq!(x.cmp(&y), x.to_string().cmp(&y.to_string()));
        prop_assert_eq!(x.to_string().parse::<Timestamp>().unwrap(), x);
    }

    #[test]
    fn trie_is_order_independent(offsets in prop::collection::vec(0u64..10_000_000, 1..60)) {
        let stamps: Vec<_> = offsets.iter().map(|o| ts(START + o, "A")).collect();
        let forward = MerkleTrie::from_timestamps(&stamps);
        let backward: MerkleTrie = stamps.iter().rev().collect();
        prop_assert_eq!(&forward, &backward);
        prop_assert!(forward.diff(&backward).is_empty());
    }

    #[test]
    fn diff_covers_every_missing_timestamp(
        shared in prop::collection::vec(0u64..50_000_000, 0..40),
        extra in prop::collection::vec(0u64..50_000_000, 1..10),
        keep in 1usize..4,
    ) {
        let base: Vec<_> = shared.iter().map(|o| ts(START + o, "A")).collect();
        let missing: Vec<_> = extra.iter().map(|o| ts(START + o, "B")).collect();

        let left = MerkleTrie::from_timestamps(&base).prune(keep);
        let right = MerkleTrie::from_timestamps(base.iter().chain(&missing));

        let ranges = left.diff(&right);
        prop_assert!(!ranges.is_empty());
        for stamp in &missing {
            prop_assert!(ranges.iter().any(|r| r.contains(stamp.millis())));
        }
        let earliest = missing.iter().map(Timestamp::millis).min().unwrap();
        prop_assert!(left.earliest_divergence(&right).unwrap() <= earliest);
    }
}
