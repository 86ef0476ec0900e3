//! Convenience re-exports.
//!
//! ```
//! use ledger_crdt::prelude::*;
//! ```

pub use crate::clock::{Clock, NodeId, Timestamp};
pub use crate::merkle::{MerkleTrie, TimeRange};
pub use crate::message::{Change, Message, WireMessage};
pub use crate::mode::SyncMode;
pub use crate::schema::Dataset;
pub use crate::value::Value;
