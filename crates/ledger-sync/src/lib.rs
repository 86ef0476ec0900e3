//! # ledger-sync
//!
//! Replication engine for a personal-finance database.
//!
//! A [`SyncEngine`] owns a store, a hybrid logical clock and a merkle trie
//! over every message it has logged. Local edits and messages from peers go
//! through the same apply pipeline:
//!
//! 1. drop messages already logged and flag ones superseded by a later write
//! 2. sort by timestamp
//! 3. write rows, log and clock record in one transaction
//! 4. notify the reactive layer, sync listeners and event subscribers
//!
//! Replicas converge by exchanging messages through a [`SyncTransport`]
//! until their tries agree ([`SyncEngine::full_sync`]).
//!
//! ## Quick Start
//!
//! ```
//! use ledger_crdt::{Change, Dataset, SyncMode, Value};
//! use ledger_store::MemoryStore;
//! use ledger_sync::{MemoryRelay, SyncEngine};
//!
//! let mut relay = MemoryRelay::new();
//! let mut laptop = SyncEngine::builder(MemoryStore::new())
//!     .mode(SyncMode::Enabled)
//!     .build()
//!     .unwrap();
//! let mut phone = SyncEngine::builder(MemoryStore::new())
//!     .mode(SyncMode::Enabled)
//!     .build()
//!     .unwrap();
//!
//! laptop
//!     .send(vec![Change::new(Dataset::Transactions, "t1", "amount", -500)])
//!     .unwrap();
//! laptop.full_sync(&mut relay).unwrap();
//! phone.full_sync(&mut relay).unwrap();
//!
//! let amount = phone.store().field(Dataset::Transactions, "t1", "amount");
//! assert_eq!(amount, Some(&Value::from(-500)));
//! ```
//!
//! ## Modes
//!
//! | Mode | Log, trie and clock record | Full sync |
//! |------|----------------------------|-----------|
//! | `Enabled` | yes | yes |
//! | `Offline` | yes | skipped |
//! | `Disabled` | no | skipped |
//! | `Import` | no, rows only, preferences rejected | skipped |

#![warn(missing_docs)]

mod apply;
pub mod config;
mod engine;
pub mod error;
pub mod listeners;
mod repair;
mod replica;
mod session;
mod snapshot;
pub mod transport;

pub use config::{ConfigError, SyncConfig};
pub use engine::{Batch, SyncEngine, SyncEngineBuilder};
pub use error::{BoxError, SyncError};
pub use listeners::{
    CallbackRegistry, ChangeObserver, MemoryPreferences, PreferenceStore, SubscriptionId,
    SyncEvent, UndoRecorder,
};
pub use repair::TrieReport;
pub use replica::ReplicaState;
pub use snapshot::Snapshot;
pub use transport::{MemoryRelay, SyncTransport};
