//! Binary envelope for sync requests and responses.
//!
//! ```text
//! [MAGIC: 0xA7][VERSION: u8][PAYLOAD: postcard]
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::{NodeId, Timestamp};
use crate::merkle::MerkleTrie;
use crate::message::WireMessage;

/// Magic byte identifying a sync envelope.
pub const MAGIC_BYTE: u8 = 0xA7;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Size of the envelope header in bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 2;

/// Error decoding an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// Data is too short to contain a header.
    #[error("data too short for sync envelope")]
    TooShort,
    /// Missing or incorrect magic byte.
    #[error("invalid magic byte: 0x{0:02X}, expected 0xA7")]
    InvalidMagic(u8),
    /// Written by a newer format.
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    /// The payload does not decode.
    #[error("malformed envelope payload: {0}")]
    Payload(String),
}

/// What a replica sends to its peer in one sync round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Sending replica.
    pub node: NodeId,
    /// Only messages after this point are wanted back.
    pub since: Timestamp,
    /// Local messages the peer may be missing.
    pub messages: Vec<WireMessage>,
}

/// The peer's answer to a [`SyncRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Messages from other replicas after `since`.
    pub messages: Vec<WireMessage>,
    /// The peer's trie after storing the request's messages.
    pub merkle: MerkleTrie,
}

/// Types carried inside a sync envelope.
pub trait Envelope: Serialize + DeserializeOwned {
    /// Encode with header.
    fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut bytes = vec![MAGIC_BYTE, ENVELOPE_VERSION];
        let payload =
            postcard::to_allocvec(self).map_err(|e| EnvelopeError::Payload(e.to_string()))?;
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Decode, checking the header.
    fn from_bytes(data: &[u8]) -> Result<Self, EnvelopeError> {
        if data.len() < ENVELOPE_HEADER_SIZE {
            return Err(EnvelopeError::TooShort);
        }
        if data[0] != MAGIC_BYTE {
            return Err(EnvelopeError::InvalidMagic(data[0]));
        }
        if data[1] > ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(data[1]));
        }
        postcard::from_bytes(&data[ENVELOPE_HEADER_SIZE..])
            .map_err(|e| EnvelopeError::Payload(e.to_string()))
    }
}

impl Envelope for SyncRequest {}
impl Envelope for SyncResponse {}
