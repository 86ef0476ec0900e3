//! Hybrid logical clock and the timestamps it produces.
//!
//! A [`Timestamp`] combines physical time with a logical counter and the id
//! of the replica that produced it:
//! - **Monotonic** per node, even when the physical clock goes backward
//! - **Totally ordered** across nodes (node id breaks ties)
//! - **Sortable as text**: the serialized form compares exactly like the value
//!
//! ```text
//! 2015-04-24T22:23:42.123Z-1000-0123456789ABCDEF
//! └──── millis (ISO-8601) ─┘ └cnt┘ └──── node ────┘
//! ```
//!
//! # Example
//!
//! ```
//! use ledger_crdt::clock::{Clock, NodeId, Timestamp};
//!
//! let mut clock = Clock::new(NodeId::new("1").unwrap());
//!
//! let ts1 = clock.now().unwrap();
//! let ts2 = clock.now().unwrap();
//! assert!(ts2 > ts1);
//!
//! let remote: Timestamp = "2100-01-01T00:00:00.000Z-0000-0000000000000002".parse().unwrap();
//! assert!(clock.recv(&remote).is_err()); // too far in the future
//! ```

use core::cmp;
use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Largest value the logical counter can hold.
pub const MAX_COUNTER: u16 = 0xFFFF;

/// Default tolerated distance between the clock and physical time (5 minutes).
pub const DEFAULT_MAX_DRIFT_MS: u64 = 5 * 60 * 1000;

/// Exclusive upper bound for `millis` (10000-01-01T00:00:00.000Z).
pub const MAX_MILLIS: u64 = 253_402_300_800_000;

/// Length of a node id in its serialized form.
pub const NODE_ID_LEN: usize = 16;

/// Length of a serialized timestamp.
pub const TIMESTAMP_LEN: usize = 46;

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Errors raised by the clock and by timestamp parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    /// A received timestamp claims the local node's identity.
    #[error("received a foreign timestamp carrying the local node id {0}")]
    Skew(NodeId),
    /// The clock would run too far ahead of physical time.
    #[error("clock drift of {drift_ms}ms exceeds the {max_drift_ms}ms limit")]
    Drift {
        /// How far ahead of physical time the clock would be.
        drift_ms: u64,
        /// Configured limit.
        max_drift_ms: u64,
    },
    /// The logical counter ran out of room within one millisecond.
    #[error("timestamp counter overflow")]
    Overflow,
    /// A string is not a well-formed timestamp.
    #[error("invalid timestamp: {0:?}")]
    Parse(String),
    /// A string is not a usable node id.
    #[error("invalid node id: {0:?}")]
    InvalidNode(String),
}

/// Identifier of a replica, always 16 ASCII characters.
///
/// Shorter ids are left-padded with `'0'`, so `"1"` and
/// `"0000000000000001"` name the same node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Build a node id from up to 16 printable ASCII characters (no `-`).
    pub fn new(id: &str) -> Result<Self, ClockError> {
        let bytes = id.as_bytes();
        let valid = !bytes.is_empty()
            && bytes.len() <= NODE_ID_LEN
            && bytes.iter().all(|b| b.is_ascii_graphic() && *b != b'-');
        if !valid {
            return Err(ClockError::InvalidNode(id.to_string()));
        }

        let mut padded = [b'0'; NODE_ID_LEN];
        padded[NODE_ID_LEN - bytes.len()..].copy_from_slice(bytes);
        Ok(Self(padded))
    }

    /// A fresh random node id (last 16 hex digits of a v4 UUID).
    pub fn random() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string().to_ascii_uppercase();
        let mut id = [b'0'; NODE_ID_LEN];
        id.copy_from_slice(&hex.as_bytes()[hex.len() - NODE_ID_LEN..]);
        Self(id)
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        // Only ASCII bytes are ever stored.
        core::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.as_str())
    }
}

impl FromStr for NodeId {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::new(&s).map_err(serde::de::Error::custom)
    }
}

/// A timestamp from the hybrid logical clock.
///
/// Field order matters: the derived ordering (millis, then counter, then
/// node) is the same as the ordering of the serialized strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    millis: u64,
    counter: u16,
    node: NodeId,
}

impl Timestamp {
    /// Create a timestamp from its parts.
    ///
    /// `millis` saturates at the last millisecond of year 9999, the latest
    /// instant the fixed-width text form can express.
    pub fn new(millis: u64, counter: u16, node: NodeId) -> Self {
        Self {
            millis: millis.min(MAX_MILLIS - 1),
            counter,
            node,
        }
    }

    /// The smallest timestamp.
    pub fn zero() -> Self {
        Self::new(0, 0, NodeId([b'0'; NODE_ID_LEN]))
    }

    /// The largest timestamp that still serializes to the fixed width.
    pub fn max() -> Self {
        Self::new(MAX_MILLIS - 1, MAX_COUNTER, NodeId([b'F'; NODE_ID_LEN]))
    }

    /// Lower bound for "everything from `millis` on" queries.
    pub fn since_millis(millis: u64) -> Self {
        Self::new(millis, 0, NodeId([b'0'; NODE_ID_LEN]))
    }

    /// Physical component in milliseconds since the Unix epoch.
    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// Logical counter.
    pub fn counter(&self) -> u16 {
        self.counter
    }

    /// Node that produced this timestamp.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// 32-bit digest of the serialized form, folded into the merkle trie.
    pub fn hash(&self) -> u32 {
        let digest = blake3::hash(self.to_string().as_bytes());
        let bytes = digest.as_bytes();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Parse the fixed-width text form.
    pub fn parse(s: &str) -> Result<Self, ClockError> {
        let invalid = || ClockError::Parse(s.to_string());

        if s.len() != TIMESTAMP_LEN || !s.is_ascii() || !has_timestamp_shape(s.as_bytes()) {
            return Err(invalid());
        }

        let date = NaiveDateTime::parse_from_str(&s[..23], DATE_FORMAT).map_err(|_| invalid())?;
        let millis = date.and_utc().timestamp_millis();
        if millis < 0 || millis as u64 >= MAX_MILLIS {
            return Err(invalid());
        }

        let counter = u16::from_str_radix(&s[25..29], 16).map_err(|_| invalid())?;
        let node = NodeId::new(&s[30..]).map_err(|_| invalid())?;

        Ok(Self::new(millis as u64, counter, node))
    }
}

/// Checks separators and digit positions of `YYYY-MM-DDTHH:MM:SS.mmmZ-CCCC-N*16`.
fn has_timestamp_shape(b: &[u8]) -> bool {
    const SEPARATORS: [(usize, u8); 9] = [
        (4, b'-'),
        (7, b'-'),
        (10, b'T'),
        (13, b':'),
        (16, b':'),
        (19, b'.'),
        (23, b'Z'),
        (24, b'-'),
        (29, b'-'),
    ];

    let separators_ok = SEPARATORS.iter().all(|&(i, c)| b[i] == c);
    let digits_ok = (0..23)
        .filter(|i| !SEPARATORS.iter().any(|&(s, _)| s == *i))
        .all(|i| b[i].is_ascii_digit());
    let counter_ok = b[25..29].iter().all(u8::is_ascii_hexdigit);

    separators_ok && digits_ok && counter_ok
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date = DateTime::from_timestamp_millis(self.millis as i64).ok_or(fmt::Error)?;
        write!(
            f,
            "{}Z-{:04X}-{}",
            date.format(DATE_FORMAT),
            self.counter,
            self.node
        )
    }
}

impl FromStr for Timestamp {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Milliseconds since the Unix epoch from the system clock.
pub fn system_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A hybrid logical clock owned by a single replica.
///
/// Call [`now`](Clock::now) to stamp a local change and
/// [`recv`](Clock::recv) for every timestamp that arrives from a peer.
#[derive(Debug, Clone)]
pub struct Clock {
    last: Timestamp,
    max_drift_ms: u64,
    /// Source of physical time in milliseconds.
    physical_time_fn: fn() -> u64,
}

impl Clock {
    /// A clock for `node` that has not produced anything yet.
    pub fn new(node: NodeId) -> Self {
        Self::from_timestamp(Timestamp::new(0, 0, node))
    }

    /// Resume a clock from its last persisted timestamp.
    pub fn from_timestamp(last: Timestamp) -> Self {
        Self {
            last,
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
            physical_time_fn: system_time_ms,
        }
    }

    /// Create a clock with a custom physical time source.
    pub fn with_time_source(node: NodeId, time_fn: fn() -> u64) -> Self {
        Self::new(node).time_source(time_fn)
    }

    /// Replace the physical time source.
    pub fn time_source(mut self, time_fn: fn() -> u64) -> Self {
        self.physical_time_fn = time_fn;
        self
    }

    /// Set the tolerated drift ahead of physical time.
    pub fn max_drift(mut self, max_drift_ms: u64) -> Self {
        self.max_drift_ms = max_drift_ms;
        self
    }

    /// Generate a timestamp for a local event.
    pub fn now(&mut self) -> Result<Timestamp, ClockError> {
        let phys = (self.physical_time_fn)();

        let millis = cmp::max(self.last.millis, phys);
        let counter = if millis == self.last.millis {
            self.last.counter.checked_add(1).ok_or(ClockError::Overflow)?
        } else {
            0
        };

        self.check_drift(millis, phys)?;
        self.last = Timestamp::new(millis, counter, self.last.node);
        Ok(self.last)
    }

    /// Fold a remote timestamp into local time.
    ///
    /// The returned timestamp is strictly greater than both the previous
    /// local timestamp and `remote`.
    pub fn recv(&mut self, remote: &Timestamp) -> Result<Timestamp, ClockError> {
        if remote.node == self.last.node {
            return Err(ClockError::Skew(remote.node));
        }

        let phys = (self.physical_time_fn)();
        self.check_drift(remote.millis, phys)?;

        let local = self.last;
        let millis = cmp::max(cmp::max(local.millis, phys), remote.millis);

        let counter = if millis == local.millis && millis == remote.millis {
            cmp::max(local.counter, remote.counter).checked_add(1)
        } else if millis == local.millis {
            local.counter.checked_add(1)
        } else if millis == remote.millis {
            remote.counter.checked_add(1)
        } else {
            Some(0)
        }
        .ok_or(ClockError::Overflow)?;

        self.check_drift(millis, phys)?;
        self.last = Timestamp::new(millis, counter, local.node);
        Ok(self.last)
    }

    fn check_drift(&self, millis: u64, phys: u64) -> Result<(), ClockError> {
        let drift_ms = millis.saturating_sub(phys);
        if drift_ms > self.max_drift_ms {
            return Err(ClockError::Drift {
                drift_ms,
                max_drift_ms: self.max_drift_ms,
            });
        }
        Ok(())
    }

    /// Node id of this clock.
    pub fn node(&self) -> NodeId {
        self.last.node
    }

    /// The last generated or received timestamp.
    pub fn last_timestamp(&self) -> Timestamp {
        self.last
    }

    /// Current physical time from this clock's time source.
    pub fn physical_time(&self) -> u64 {
        (self.physical_time_fn)()
    }
}
