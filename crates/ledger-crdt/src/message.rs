//! Change messages: the unit of replication.
//!
//! A [`Message`] says "field `column` of row `row` in `dataset` was set to
//! `value` at `timestamp`". Replicas exchange messages in their
//! [`WireMessage`] form, with the value and timestamp encoded as strings.

use serde::{Deserialize, Serialize};

use crate::clock::{ClockError, Timestamp};
use crate::schema::{Dataset, UnknownDataset};
use crate::value::{EncodingError, Value};

/// A single field assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Target dataset.
    pub dataset: Dataset,
    /// Row id.
    pub row: String,
    /// Column name (or preference key for [`Dataset::Prefs`]).
    pub column: String,
    /// New value.
    pub value: Value,
    /// When the assignment happened.
    pub timestamp: Timestamp,
    /// Set during deduplication when a later assignment to the same field
    /// has already been applied. Never serialized.
    #[serde(skip)]
    pub old: bool,
}

impl Message {
    /// Create a message.
    pub fn new(
        dataset: Dataset,
        row: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<Value>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            dataset,
            row: row.into(),
            column: column.into(),
            value: value.into(),
            timestamp,
            old: false,
        }
    }

    /// The field this message writes.
    pub fn field(&self) -> (Dataset, &str, &str) {
        (self.dataset, &self.row, &self.column)
    }

    /// Decode a message received from a peer.
    pub fn from_wire(wire: &WireMessage) -> Result<Self, MessageError> {
        let dataset = wire.dataset.parse::<Dataset>()?;
        let value = Value::decode(&wire.value)?;
        let timestamp = Timestamp::parse(&wire.timestamp)?;
        Ok(Self {
            dataset,
            row: wire.row.clone(),
            column: wire.column.clone(),
            value,
            timestamp,
            old: false,
        })
    }

    /// Encode for transmission.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            dataset: self.dataset.name().to_string(),
            row: self.row.clone(),
            column: self.column.clone(),
            value: self.value.encode(),
            timestamp: self.timestamp.to_string(),
        }
    }
}

/// A message as exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Dataset name.
    pub dataset: String,
    /// Row id.
    pub row: String,
    /// Column name.
    pub column: String,
    /// Value in tagged text form.
    pub value: String,
    /// Timestamp in text form.
    pub timestamp: String,
}

/// Why a [`WireMessage`] could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The dataset name is not known.
    #[error(transparent)]
    Dataset(#[from] UnknownDataset),
    /// The value is not a valid encoding.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// The timestamp does not parse.
    #[error(transparent)]
    Timestamp(#[from] ClockError),
}

/// A local edit that has not been stamped yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Target dataset.
    pub dataset: Dataset,
    /// Row id.
    pub row: String,
    /// Column name.
    pub column: String,
    /// New value.
    pub value: Value,
}

impl Change {
    /// Create a change.
    pub fn new(
        dataset: Dataset,
        row: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            dataset,
            row: row.into(),
            column: column.into(),
            value: value.into(),
        }
    }

    /// Attach a timestamp, producing a message.
    pub fn stamp(self, timestamp: Timestamp) -> Message {
        Message {
            dataset: self.dataset,
            row: self.row,
            column: self.column,
            value: self.value,
            timestamp,
            old: false,
        }
    }
}

/// Distinct datasets touched by messages that were actually applied.
pub fn applied_tables(messages: &[Message]) -> Vec<Dataset> {
    let mut tables: Vec<Dataset> = messages
        .iter()
        .filter(|m| !m.old)
        .map(|m| m.dataset)
        .collect();
    tables.sort();
    tables.dedup();
    tables
}
