//! # ledger-crdt
//!
//! Building blocks for replicating a personal-finance database between
//! devices without coordination.
//!
//! Every edit is a [`Message`] setting one field of one row, stamped by a
//! hybrid logical [`Clock`]. Replicas apply messages last-writer-wins per
//! field, so applying the same set of messages in any order yields the same
//! state. A [`MerkleTrie`] over the timestamps a replica has seen lets two
//! replicas find the time windows where their histories differ.
//!
//! This crate performs no I/O; persistence lives in `ledger-store` and the
//! apply pipeline and sync protocol in `ledger-sync`.
//!
//! ## Quick Start
//!
//! ```
//! use ledger_crdt::prelude::*;
//!
//! let mut clock = Clock::new(NodeId::new("A1").unwrap());
//! let msg = Change::new(Dataset::Transactions, "t1", "amount", -500)
//!     .stamp(clock.now().unwrap());
//!
//! let wire = msg.to_wire();
//! assert_eq!(wire.value, "N:-500");
//! assert_eq!(Message::from_wire(&wire).unwrap(), msg);
//!
//! let trie = MerkleTrie::new().insert(&msg.timestamp);
//! assert_eq!(trie.count(), 1);
//! ```

#![warn(missing_docs)]

pub mod clock;
pub mod envelope;
pub mod merkle;
pub mod message;
pub mod mode;
pub mod prelude;
pub mod schema;
pub mod value;

pub use clock::{Clock, ClockError, NodeId, Timestamp};
pub use envelope::{Envelope, EnvelopeError, SyncRequest, SyncResponse};
pub use merkle::{MerkleTrie, TimeRange, TrieError};
pub use message::{Change, Message, MessageError, WireMessage};
pub use mode::SyncMode;
pub use schema::Dataset;
pub use value::{EncodingError, Value};
