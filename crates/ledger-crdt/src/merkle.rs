//! Merkle trie summarizing a set of timestamps.
//!
//! Each timestamp is keyed by its minute bucket written as 16 base-4 digits,
//! so the digits from the root down name ever narrower time windows. Every
//! node stores the XOR of the hashes of all timestamps below it together
//! with their count. Two replicas compare roots first and only descend where
//! the summaries differ, which locates missing messages in
//! `O(divergent paths × depth)`.
//!
//! The trie is persistent: [`insert`](MerkleTrie::insert) and the prune
//! operations return a new trie and share every untouched subtree with the
//! old one. Chains of single-child nodes are compressed into one labelled
//! edge.
//!
//! ```
//! use ledger_crdt::clock::Timestamp;
//! use ledger_crdt::merkle::MerkleTrie;
//!
//! let a: Timestamp = "2018-11-13T13:20:40.122Z-0000-0123456789ABCDEF".parse().unwrap();
//! let b: Timestamp = "2018-11-13T13:21:40.122Z-0000-0123456789ABCDEF".parse().unwrap();
//!
//! let left = MerkleTrie::new().insert(&a);
//! let right = left.insert(&b);
//!
//! let ranges = left.diff(&right);
//! assert_eq!(ranges.len(), 1);
//! assert!(ranges[0].contains(b.millis()));
//! assert_eq!(left.earliest_divergence(&right), Some(ranges[0].start));
//! ```

use std::sync::Arc;

use serde::{de, Deserialize, Deserializer, Serialize};

use crate::clock::Timestamp;

/// Number of digits in a key.
pub const KEY_DIGITS: usize = 16;

/// Children per node.
pub const RADIX: u64 = 4;

const BUCKET_MS: u64 = 60 * 1000;

/// Default number of recent children kept expanded by [`MerkleTrie::prune`].
pub const DEFAULT_PRUNE_KEEP: usize = 2;

/// Half-open time window `[start, end)` in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// First millisecond inside the window.
    pub start: u64,
    /// First millisecond after the window.
    pub end: u64,
}

impl TimeRange {
    /// Window covered by a key prefix.
    pub fn for_prefix(prefix: &[u8]) -> Self {
        let value = prefix
            .iter()
            .fold(0u64, |acc, digit| acc * RADIX + u64::from(digit - b'0'));
        let span = RADIX.pow((KEY_DIGITS - prefix.len()) as u32);
        Self {
            start: value * span * BUCKET_MS,
            end: (value + 1) * span * BUCKET_MS,
        }
    }

    /// Whether `millis` falls inside the window.
    pub fn contains(&self, millis: u64) -> bool {
        self.start <= millis && millis < self.end
    }

    /// Smallest timestamp inside the window.
    pub fn start_timestamp(&self) -> Timestamp {
        Timestamp::since_millis(self.start)
    }
}

/// Structural problems in a trie decoded from outside.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrieError {
    /// An edge carries no digits.
    #[error("trie edge has an empty label")]
    EmptyLabel,
    /// A label holds something other than a base-4 digit.
    #[error("trie edge label {0:?} is not base-4")]
    BadDigit(String),
    /// A path runs past the key length.
    #[error("trie path is deeper than {} digits", KEY_DIGITS)]
    TooDeep,
    /// Siblings are unsorted or share a first digit.
    #[error("trie children are not in ascending digit order")]
    UnorderedChildren,
}

/// Key of a timestamp: its minute bucket as 16 ASCII base-4 digits.
pub fn key_of(timestamp: &Timestamp) -> [u8; KEY_DIGITS] {
    let mut minutes = timestamp.millis() / BUCKET_MS;
    let mut key = [b'0'; KEY_DIGITS];
    for slot in key.iter_mut().rev() {
        *slot = b'0' + (minutes % RADIX) as u8;
        minutes /= RADIX;
    }
    key
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Node {
    hash: u32,
    count: u64,
    children: Vec<Edge>,
    /// Children were discarded; only the summary is left.
    pruned: bool,
}

/// Compressed edge; `label` holds one or more key digits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Edge {
    label: String,
    node: Arc<Node>,
}

impl Edge {
    fn first(&self) -> u8 {
        self.label.as_bytes()[0]
    }
}

impl Node {
    fn leaf(hash: u32) -> Self {
        Self {
            hash,
            count: 1,
            ..Self::default()
        }
    }

    fn child(&self, digit: u8) -> Option<&Edge> {
        self.children.iter().find(|edge| edge.first() == digit)
    }

    fn put_child(&mut self, edge: Edge) {
        match self.children.iter().position(|e| e.first() >= edge.first()) {
            Some(i) if self.children[i].first() == edge.first() => self.children[i] = edge,
            Some(i) => self.children.insert(i, edge),
            None => self.children.push(edge),
        }
    }

    /// Check the invariants every traversal relies on.
    fn validate(&self, depth: usize) -> Result<(), TrieError> {
        let mut previous = None;
        for edge in &self.children {
            let label = edge.label.as_bytes();
            let Some(&first) = label.first() else {
                return Err(TrieError::EmptyLabel);
            };
            if !label.iter().all(|d| (b'0'..b'0' + RADIX as u8).contains(d)) {
                return Err(TrieError::BadDigit(edge.label.clone()));
            }
            if depth + label.len() > KEY_DIGITS {
                return Err(TrieError::TooDeep);
            }
            if previous.is_some_and(|p| p >= first) {
                return Err(TrieError::UnorderedChildren);
            }
            previous = Some(first);
            edge.node.validate(depth + label.len())?;
        }
        Ok(())
    }

    fn collapsed(&self) -> Arc<Node> {
        Arc::new(Node {
            hash: self.hash,
            count: self.count,
            children: Vec::new(),
            pruned: true,
        })
    }

    fn with_inserted(&self, key: &[u8], hash: u32) -> Node {
        let mut next = self.clone();
        next.hash ^= hash;
        next.count += 1;
        if next.pruned || key.is_empty() {
            return next;
        }

        let edge = match self.child(key[0]) {
            None => Edge {
                label: digits(key),
                node: Arc::new(Node::leaf(hash)),
            },
            Some(edge) => {
                let label = edge.label.as_bytes();
                let common = common_prefix(label, key);
                if common == label.len() {
                    Edge {
                        label: edge.label.clone(),
                        node: Arc::new(edge.node.with_inserted(&key[common..], hash)),
                    }
                } else {
                    let mut split = Node {
                        hash: edge.node.hash,
                        count: edge.node.count,
                        ..Node::default()
                    };
                    split.children.push(Edge {
                        label: digits(&label[common..]),
                        node: Arc::clone(&edge.node),
                    });
                    Edge {
                        label: digits(&key[..common]),
                        node: Arc::new(split.with_inserted(&key[common..], hash)),
                    }
                }
            }
        };
        next.put_child(edge);
        next
    }

    fn pruned_recent(&self, keep: usize) -> Node {
        if self.pruned || self.children.is_empty() {
            return self.clone();
        }
        let split_at = self.children.len().saturating_sub(keep);
        let children = self
            .children
            .iter()
            .enumerate()
            .map(|(i, edge)| Edge {
                label: edge.label.clone(),
                node: if i < split_at {
                    collapse(&edge.node)
                } else {
                    Arc::new(edge.node.pruned_recent(keep))
                },
            })
            .collect();
        Node {
            children,
            ..self.clone()
        }
    }

    fn pruned_before(&self, prefix: &mut Vec<u8>, horizon: u64) -> Node {
        if self.pruned || self.children.is_empty() {
            return self.clone();
        }
        let mut children = Vec::with_capacity(self.children.len());
        for edge in &self.children {
            let depth = prefix.len();
            prefix.extend_from_slice(edge.label.as_bytes());
            let range = TimeRange::for_prefix(prefix);
            let node = if range.end <= horizon {
                collapse(&edge.node)
            } else if range.start < horizon {
                Arc::new(edge.node.pruned_before(prefix, horizon))
            } else {
                Arc::clone(&edge.node)
            };
            prefix.truncate(depth);
            children.push(Edge {
                label: edge.label.clone(),
                node,
            });
        }
        Node {
            children,
            ..self.clone()
        }
    }
}

fn collapse(node: &Arc<Node>) -> Arc<Node> {
    if node.children.is_empty() {
        Arc::clone(node)
    } else {
        node.collapsed()
    }
}

fn digits(bytes: &[u8]) -> String {
    bytes.iter().map(|b| char::from(*b)).collect()
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// A position in the logical (uncompressed) trie: either on a node or
/// part-way along an edge leading to `node`.
#[derive(Clone, Copy)]
struct Cursor<'a> {
    node: &'a Node,
    pending: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn root(node: &'a Node) -> Self {
        Self { node, pending: &[] }
    }

    fn summary(cursor: Option<Self>) -> (u32, u64) {
        cursor.map_or((0, 0), |c| (c.node.hash, c.node.count))
    }

    fn is_opaque(cursor: Option<Self>) -> bool {
        cursor.is_some_and(|c| c.pending.is_empty() && c.node.pruned)
    }

    fn child(cursor: Option<Self>, digit: u8) -> Option<Self> {
        let c = cursor?;
        if let Some((first, rest)) = c.pending.split_first() {
            return (*first == digit).then_some(Self {
                node: c.node,
                pending: rest,
            });
        }
        let edge = c.node.child(digit)?;
        Some(Self {
            node: edge.node.as_ref(),
            pending: &edge.label.as_bytes()[1..],
        })
    }
}

fn diff_at(
    a: Option<Cursor<'_>>,
    b: Option<Cursor<'_>>,
    prefix: &mut Vec<u8>,
    out: &mut Vec<TimeRange>,
) {
    if Cursor::summary(a) == Cursor::summary(b) {
        return;
    }
    if prefix.len() == KEY_DIGITS || Cursor::is_opaque(a) || Cursor::is_opaque(b) {
        out.push(TimeRange::for_prefix(prefix));
        return;
    }

    let before = out.len();
    for digit in b'0'..b'0' + RADIX as u8 {
        prefix.push(digit);
        diff_at(Cursor::child(a, digit), Cursor::child(b, digit), prefix, out);
        prefix.pop();
    }
    // Summaries differ but no child does: fall back to the whole window.
    if out.len() == before {
        out.push(TimeRange::for_prefix(prefix));
    }
}

fn coalesce(ranges: Vec<TimeRange>) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.end >= range.start => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

/// Persistent merkle trie over timestamps.
///
/// Equality compares the root summaries: two tries are equal when they
/// describe the same set of timestamps, however differently they are pruned.
///
/// Decoding rejects malformed structure with a [`TrieError`], so a trie
/// received from a peer is safe to [`diff`](MerkleTrie::diff).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct MerkleTrie {
    root: Arc<Node>,
}

impl<'de> Deserialize<'de> for MerkleTrie {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let root = Node::deserialize(deserializer)?;
        root.validate(0).map_err(de::Error::custom)?;
        Ok(Self {
            root: Arc::new(root),
        })
    }
}

impl MerkleTrie {
    /// Create an empty trie.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a trie from scratch out of a sequence of timestamps.
    pub fn from_timestamps<'a>(timestamps: impl IntoIterator<Item = &'a Timestamp>) -> Self {
        timestamps
            .into_iter()
            .fold(Self::new(), |trie, ts| trie.insert(ts))
    }

    /// Return a trie that also summarizes `timestamp`.
    #[must_use]
    pub fn insert(&self, timestamp: &Timestamp) -> Self {
        let key = key_of(timestamp);
        Self {
            root: Arc::new(self.root.with_inserted(&key, timestamp.hash())),
        }
    }

    /// Keep only the `keep` most recent children of every node expanded;
    /// older siblings are collapsed into summary-only nodes.
    #[must_use]
    pub fn prune(&self, keep: usize) -> Self {
        Self {
            root: Arc::new(self.root.pruned_recent(keep.max(1))),
        }
    }

    /// Collapse every subtree whose window ends at or before `horizon_millis`.
    #[must_use]
    pub fn prune_before(&self, horizon_millis: u64) -> Self {
        Self {
            root: Arc::new(self.root.pruned_before(&mut Vec::new(), horizon_millis)),
        }
    }

    /// Time windows where the two tries disagree, in ascending order with
    /// adjacent windows merged. Empty when the tries are equal.
    pub fn diff(&self, other: &MerkleTrie) -> Vec<TimeRange> {
        let mut out = Vec::new();
        diff_at(
            Some(Cursor::root(&self.root)),
            Some(Cursor::root(&other.root)),
            &mut Vec::with_capacity(KEY_DIGITS),
            &mut out,
        );
        coalesce(out)
    }

    /// Start of the earliest window where the tries disagree.
    pub fn earliest_divergence(&self, other: &MerkleTrie) -> Option<u64> {
        self.diff(other).first().map(|range| range.start)
    }

    /// XOR of every summarized timestamp hash.
    pub fn hash(&self) -> u32 {
        self.root.hash
    }

    /// Number of summarized timestamps.
    pub fn count(&self) -> u64 {
        self.root.count
    }

    /// Whether nothing has been inserted.
    pub fn is_empty(&self) -> bool {
        self.root.count == 0
    }
}

impl PartialEq for MerkleTrie {
    fn eq(&self, other: &Self) -> bool {
        self.root.hash == other.root.hash && self.root.count == other.root.count
    }
}

impl Eq for MerkleTrie {}

impl<'a> FromIterator<&'a Timestamp> for MerkleTrie {
    fn from_iter<I: IntoIterator<Item = &'a Timestamp>>(iter: I) -> Self {
        Self::from_timestamps(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60 * 1000;
    const BASE: u64 = 1_542_115_240_122; // 2018-11-13T13:20:40.122Z

    fn ts(millis: u64, node: &str) -> Timestamp {
        Timestamp::new(millis, 0, crate::clock::NodeId::new(node).unwrap())
    }

    #[test]
    fn empty_tries_agree() {
        assert!(MerkleTrie::new().diff(&MerkleTrie::new()).is_empty());
        assert!(MerkleTrie::new().is_empty());
    }

    #[test]
    fn insert_updates_summary() {
        let a = ts(BASE, "1");
        let b = ts(BASE + MINUTE, "1");
        let trie = MerkleTrie::new().insert(&a).insert(&b);
        assert_eq!(trie.count(), 2);
        assert_eq!(trie.hash(), a.hash() ^ b.hash());
    }

    #[test]
    fn insert_order_does_not_matter() {
        let stamps: Vec<_> = (0..20).map(|i| ts(BASE + i * 7 * MINUTE, "1")).collect();
        let forward = MerkleTrie::from_timestamps(&stamps);
        let backward: MerkleTrie = stamps.iter().rev().collect();
        assert_eq!(forward, backward);
        assert!(forward.diff(&backward).is_empty());
    }

    #[test]
    fn insert_keeps_previous_version() {
        let first = MerkleTrie::new().insert(&ts(BASE, "1"));
        let second = first.insert(&ts(BASE + MINUTE, "1"));
        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 2);
    }

    #[test]
    fn diff_finds_missing_minute() {
        let shared: Vec<_> = (0..5).map(|i| ts(BASE + i * MINUTE, "1")).collect();
        let extra = ts(BASE + 3 * MINUTE + 500, "2");

        let left = MerkleTrie::from_timestamps(&shared);
        let right = left.insert(&extra);

        let ranges = right.diff(&left);
        assert_eq!(ranges.len(), 1);
        assert!(ranges[0].contains(extra.millis()));
        assert_eq!(ranges[0].end - ranges[0].start, MINUTE);
        assert_eq!(left.diff(&right), ranges);
    }

    #[test]
    fn diff_reports_each_divergent_window() {
        let left = MerkleTrie::new().insert(&ts(BASE, "1"));
        let right = MerkleTrie::new().insert(&ts(BASE + 30 * 24 * 60 * MINUTE, "2"));

        let ranges = left.diff(&right);
        assert_eq!(ranges.len(), 2);
        assert!(ranges[0].contains(BASE));
        assert!(ranges[1].contains(BASE + 30 * 24 * 60 * MINUTE));
        assert_eq!(left.earliest_divergence(&right), Some(ranges[0].start));
    }

    #[test]
    fn adjacent_windows_are_merged() {
        let start = 16 * MINUTE * 1000;
        let left = MerkleTrie::new()
            .insert(&ts(start, "1"))
            .insert(&ts(start + MINUTE, "1"));
        let ranges = left.diff(&MerkleTrie::new());
        assert_eq!(ranges.len(), 1);
        assert!(ranges[0].contains(start));
        assert!(ranges[0].contains(start + MINUTE));
    }

    #[test]
    fn prune_keeps_summary() {
        let stamps: Vec<_> = (0..200).map(|i| ts(BASE + i * 13 * MINUTE, "1")).collect();
        let trie = MerkleTrie::from_timestamps(&stamps);
        let pruned = trie.prune(DEFAULT_PRUNE_KEEP);
        assert_eq!(pruned, trie);
        assert!(pruned.diff(&trie).is_empty());
    }

    #[test]
    fn pruned_trie_still_detects_old_divergence() {
        let stamps: Vec<_> = (0..50).map(|i| ts(BASE + i * 60 * MINUTE, "1")).collect();
        let full = MerkleTrie::from_timestamps(&stamps);
        let pruned = full.prune(DEFAULT_PRUNE_KEEP);

        let late = ts(BASE + MINUTE, "2");
        let other = full.insert(&late);

        let ranges = pruned.diff(&other);
        assert!(!ranges.is_empty());
        assert!(ranges[0].contains(late.millis()));
    }

    #[test]
    fn insert_under_pruned_node_updates_summary() {
        let stamps: Vec<_> = (0..50).map(|i| ts(BASE + i * 60 * MINUTE, "1")).collect();
        let late = ts(BASE + MINUTE, "2");

        let pruned = MerkleTrie::from_timestamps(&stamps)
            .prune(1)
            .insert(&late);
        let full = MerkleTrie::from_timestamps(stamps.iter().chain([&late]));

        assert_eq!(pruned, full);
        assert!(pruned.diff(&full).is_empty());
    }

    #[test]
    fn prune_before_collapses_history() {
        let stamps: Vec<_> = (0..100).map(|i| ts(BASE + i * 30 * MINUTE, "1")).collect();
        let trie = MerkleTrie::from_timestamps(&stamps);
        let horizon = BASE + 50 * 30 * MINUTE;
        let pruned = trie.prune_before(horizon);
        assert_eq!(pruned, trie);

        let recent = ts(horizon + 10 * MINUTE, "2");
        let ranges = pruned.diff(&trie.insert(&recent));
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].end - ranges[0].start, MINUTE);
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let stamps: Vec<_> = (0..10).map(|i| ts(BASE + i * 3 * MINUTE, "1")).collect();
        let trie = MerkleTrie::from_timestamps(&stamps).prune(DEFAULT_PRUNE_KEEP);
        let json = serde_json::to_string(&trie).unwrap();
        let back: MerkleTrie = serde_json::from_str(&json).unwrap();
        assert_eq!(back.root, trie.root);
    }

    fn decode(json: &str) -> Result<MerkleTrie, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[test]
    fn malformed_tries_are_rejected() {
        let leaf = r#"{"hash":1,"count":1,"children":[],"pruned":false}"#;
        let with_label = |label: &str| {
            format!(
                r#"{{"hash":1,"count":1,"children":[{{"label":"{label}","node":{leaf}}}],"pruned":false}}"#
            )
        };

        let err = decode(&with_label("")).unwrap_err();
        assert!(err.to_string().contains("empty label"));
        let err = decode(&with_label("0019")).unwrap_err();
        assert!(err.to_string().contains("not base-4"));
        assert!(decode(&with_label(&"0".repeat(KEY_DIGITS + 1))).is_err());
        assert!(decode(&with_label(&"0".repeat(KEY_DIGITS))).is_ok());

        let twins = format!(
            r#"{{"hash":0,"count":2,"children":[{{"label":"1","node":{leaf}}},{{"label":"1","node":{leaf}}}],"pruned":false}}"#
        );
        let err = decode(&twins).unwrap_err();
        assert!(err.to_string().contains("ascending"));
    }

    #[test]
    fn decoded_peer_trie_can_be_diffed() {
        let leaf = r#"{"hash":7,"count":1,"children":[],"pruned":false}"#;
        let json = format!(
            r#"{{"hash":7,"count":1,"children":[{{"label":"{}","node":{leaf}}}],"pruned":false}}"#,
            "0".repeat(KEY_DIGITS)
        );
        let remote = decode(&json).unwrap();
        let ranges = MerkleTrie::new().diff(&remote);
        assert_eq!(ranges, vec![TimeRange { start: 0, end: MINUTE }]);
        assert_eq!(ranges[0].start_timestamp(), Timestamp::since_millis(0));
    }

    #[test]
    fn key_is_minute_bucket() {
        let key = key_of(&ts(5 * MINUTE + 1, "1"));
        assert_eq!(&key, b"0000000000000011");
        let range = TimeRange::for_prefix(&key);
        assert_eq!(range, TimeRange { start: 5 * MINUTE, end: 6 * MINUTE });
    }
}
