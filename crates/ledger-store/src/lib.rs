//! # ledger-store
//!
//! Persistence backends for ledger replicas.
//!
//! A replica stores three things: the rows of every dataset, the
//! append-only log of applied change messages, and one clock record. The
//! traits in this crate cover each of those plus atomic transactions; the
//! sync engine in `ledger-sync` is generic over them.
//!
//! ## Quick Start
//!
//! ```
//! use ledger_crdt::{Dataset, Value};
//! use ledger_store::{MemoryStore, RowStore, Transactional};
//!
//! let mut store = MemoryStore::new();
//! store
//!     .transaction(|s| s.insert_row(Dataset::Payees, "p1", "name", &Value::from("Grocer")))
//!     .unwrap();
//! assert!(store.row_exists(Dataset::Payees, "p1").unwrap());
//! ```
//!
//! ## Backends
//!
//! | Backend | Feature flag | Use case |
//! |---------|-------------|----------|
//! | [`MemoryStore`] | *(always available)* | Testing, prototyping |
//! | `SqliteStore` | `sqlite` | Desktop, mobile, server replicas |

#![warn(missing_docs)]

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;

pub use memory::{MemoryError, MemoryStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{JournalMode, SqliteConfig, SqliteError, SqliteStore};
pub use traits::*;
