//! Merkle trie over message timestamps.
//!
//! Messages are bucketed by the minute they were stamped in. The minute count
//! since the epoch is written as [`KEY_DEPTH`] base-3 digits, most significant
//! first, and that digit string is the message's path through the trie. Every
//! node stores the XOR of the hashes of all messages below it plus their
//! count, so two replicas holding the same message set have bit-identical
//! nodes regardless of insertion order, and a subtree whose hashes agree can
//! be skipped entirely while looking for divergence.
//!
//! Nodes live in an index-addressed arena; the root is index 0 and always
//! exists.

use crate::message::ChangeMessage;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Number of base-3 digits in a full key; enough minutes for any valid timestamp.
pub const KEY_DEPTH: usize = 21;

/// Children per node.
pub const BRANCHES: usize = 3;

/// Width of a leaf bucket in milliseconds.
pub const BUCKET_MS: u64 = 60_000;

type NodeIndex = u32;

/// A 32-byte node or message hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TrieHash([u8; 32]);

impl TrieHash {
    /// Hash of an empty subtree.
    pub const ZERO: TrieHash = TrieHash([0; 32]);

    /// Wraps raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns true for the empty-subtree hash.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    /// Leaf contribution of a message: SHA-256 over its timestamp and cell.
    #[must_use]
    pub fn of_message(message: &ChangeMessage) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(message.timestamp.to_bytes());
        hasher.update(message.dataset.0.to_be_bytes());
        hasher.update(message.row.as_bytes());
        hasher.update(message.column.0.to_be_bytes());
        Self(hasher.finalize().into())
    }

    fn absorb(&mut self, other: &TrieHash) {
        for (byte, other) in self.0.iter_mut().zip(other.0.iter()) {
            *byte ^= other;
        }
    }

    /// Lower-case hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for TrieHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrieHash({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for TrieHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A path from the root: up to [`KEY_DEPTH`] base-3 digits.
///
/// A prefix names a trie node and the half-open time range that node covers.
/// Prefixes order lexicographically by digits, which is also time order for
/// prefixes of equal length.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    len: u8,
    digits: [u8; KEY_DEPTH],
}

impl Prefix {
    /// The empty prefix: the whole history.
    pub const ROOT: Prefix = Prefix {
        len: 0,
        digits: [0; KEY_DEPTH],
    };

    /// Full-depth key of the bucket containing `millis`.
    #[must_use]
    pub fn for_millis(millis: u64) -> Self {
        let mut minutes = millis / BUCKET_MS;
        let mut digits = [0u8; KEY_DEPTH];
        for digit in digits.iter_mut().rev() {
            *digit = (minutes % BRANCHES as u64) as u8;
            minutes /= BRANCHES as u64;
        }
        Self {
            len: KEY_DEPTH as u8,
            digits,
        }
    }

    /// Builds a prefix from digits; `None` if too long or a digit is not 0..=2.
    #[must_use]
    pub fn from_digits(digits: &[u8]) -> Option<Self> {
        if digits.len() > KEY_DEPTH || digits.iter().any(|&d| d as usize >= BRANCHES) {
            return None;
        }
        let mut prefix = Self::ROOT;
        prefix.digits[..digits.len()].copy_from_slice(digits);
        prefix.len = digits.len() as u8;
        Some(prefix)
    }

    /// Number of digits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true for [`Prefix::ROOT`].
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.len == 0
    }

    /// Returns true for a full-depth bucket.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.len() == KEY_DEPTH
    }

    /// The digits.
    #[must_use]
    pub fn digits(&self) -> &[u8] {
        &self.digits[..self.len()]
    }

    /// Extends by one digit; `None` for a leaf or an invalid digit.
    #[must_use]
    pub fn child(&self, digit: u8) -> Option<Prefix> {
        if self.is_leaf() || digit as usize >= BRANCHES {
            return None;
        }
        let mut child = *self;
        child.digits[self.len()] = digit;
        child.len += 1;
        Some(child)
    }

    /// Drops the last digit; `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Prefix> {
        if self.is_root() {
            return None;
        }
        Prefix::from_digits(&self.digits()[..self.len() - 1])
    }

    /// Returns true if `other` lies in this prefix's subtree (or is this prefix).
    #[must_use]
    pub fn covers(&self, other: &Prefix) -> bool {
        other.len >= self.len && other.digits()[..self.len()] == *self.digits()
    }

    /// Range of minutes since the epoch covered by this prefix.
    #[must_use]
    pub fn minute_range(&self) -> Range<u64> {
        let base = BRANCHES as u64;
        let start = self
            .digits()
            .iter()
            .enumerate()
            .map(|(i, &d)| u64::from(d) * base.pow((KEY_DEPTH - 1 - i) as u32))
            .sum::<u64>();
        let width = base.pow((KEY_DEPTH - self.len()) as u32);
        start..start + width
    }

    /// Range of milliseconds covered by this prefix.
    #[must_use]
    pub fn millis_range(&self) -> Range<u64> {
        let minutes = self.minute_range();
        minutes.start * BUCKET_MS..minutes.end * BUCKET_MS
    }

    /// Returns true if a message stamped at `millis` falls under this prefix.
    #[must_use]
    pub fn contains_millis(&self, millis: u64) -> bool {
        self.covers(&Prefix::for_millis(millis))
    }
}

impl Ord for Prefix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.digits().cmp(other.digits())
    }
}

impl PartialOrd for Prefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("<root>");
        }
        for digit in self.digits() {
            write!(f, "{digit}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prefix({self})")
    }
}

impl FromStr for Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "<root>" {
            return Ok(Prefix::ROOT);
        }
        let digits: Option<Vec<u8>> = s
            .chars()
            .map(|c| c.to_digit(BRANCHES as u32).map(|d| d as u8))
            .collect();
        digits
            .and_then(|d| Prefix::from_digits(&d))
            .ok_or_else(|| format!("invalid trie prefix {s:?}"))
    }
}

/// Hash and count of one node, as exchanged during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSummary {
    /// Node path.
    pub prefix: Prefix,
    /// XOR of message hashes under the node.
    pub hash: TrieHash,
    /// Number of messages under the node.
    pub count: u64,
}

/// Which side is missing messages within a divergent range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Only the remote side has messages here.
    Pull,
    /// Only the local side has messages here.
    Push,
    /// Both sides have messages the other may lack.
    Both,
}

impl Direction {
    /// Returns true if remote messages must be fetched.
    #[must_use]
    pub fn needs_pull(self) -> bool {
        matches!(self, Direction::Pull | Direction::Both)
    }

    /// Returns true if local messages must be sent.
    #[must_use]
    pub fn needs_push(self) -> bool {
        matches!(self, Direction::Push | Direction::Both)
    }
}

/// A time range whose messages differ between two replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divergence {
    /// Range, as a trie prefix.
    pub prefix: Prefix,
    /// What has to move.
    pub direction: Direction,
}

/// Outcome of comparing the local trie against one window of a remote trie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStep {
    /// Ranges known to differ.
    pub divergent: Vec<Divergence>,
    /// Prefixes whose hashes differ but whose children were outside the window.
    pub frontier: Vec<Prefix>,
}

impl DiffStep {
    /// Returns true if nothing differs and nothing is left to inspect.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.divergent.is_empty() && self.frontier.is_empty()
    }
}

/// A partial picture of a remote trie assembled from [`NodeSummary`] lists.
#[derive(Debug, Clone, Default)]
pub struct TrieView {
    nodes: HashMap<Prefix, NodeSummary>,
}

impl TrieView {
    /// Collects node summaries.
    pub fn from_nodes(nodes: impl IntoIterator<Item = NodeSummary>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.prefix, n)).collect(),
        }
    }

    /// The node at `prefix`, if the remote reported a non-empty one.
    #[must_use]
    pub fn get(&self, prefix: &Prefix) -> Option<&NodeSummary> {
        self.nodes.get(prefix).filter(|n| n.count > 0)
    }

    /// Number of reported nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing was reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    hash: TrieHash,
    count: u64,
    children: [Option<NodeIndex>; BRANCHES],
}

/// The merkle trie.
#[derive(Debug, Clone)]
pub struct MerkleTrie {
    nodes: Vec<Node>,
}

impl Default for MerkleTrie {
    fn default() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }
}

impl MerkleTrie {
    /// An empty trie.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a trie from a message history.
    pub fn from_messages<'a>(messages: impl IntoIterator<Item = &'a ChangeMessage>) -> Self {
        let mut trie = Self::new();
        for message in messages {
            trie.insert(message);
        }
        trie
    }

    /// Adds a message. O([`KEY_DEPTH`]).
    ///
    /// Each distinct message must be inserted exactly once: XOR cancels a
    /// second insertion of the same message.
    pub fn insert(&mut self, message: &ChangeMessage) {
        let key = Prefix::for_millis(message.timestamp.millis());
        let hash = TrieHash::of_message(message);

        let mut index = 0usize;
        self.touch(index, &hash);
        for &digit in key.digits() {
            let next = match self.nodes[index].children[digit as usize] {
                Some(child) => child as usize,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[index].children[digit as usize] = Some(child as NodeIndex);
                    child
                }
            };
            index = next;
            self.touch(index, &hash);
        }
    }

    fn touch(&mut self, index: usize, hash: &TrieHash) {
        let node = &mut self.nodes[index];
        node.hash.absorb(hash);
        node.count += 1;
    }

    /// Hash of the whole history.
    #[must_use]
    pub fn root_hash(&self) -> TrieHash {
        self.nodes[0].hash
    }

    /// Number of messages inserted.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.nodes[0].count
    }

    /// Returns true if no message was inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of allocated nodes, root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn lookup(&self, prefix: &Prefix) -> Option<usize> {
        let mut index = 0usize;
        for &digit in prefix.digits() {
            index = self.nodes[index].children[digit as usize]? as usize;
        }
        Some(index)
    }

    fn non_empty(&self, index: Option<usize>) -> Option<usize> {
        index.filter(|&i| self.nodes[i].count > 0)
    }

    fn child(&self, index: Option<usize>, digit: usize) -> Option<usize> {
        index.and_then(|i| self.nodes[i].children[digit].map(|c| c as usize))
    }

    /// Summary of the node at `prefix`, if it exists.
    #[must_use]
    pub fn node(&self, prefix: &Prefix) -> Option<NodeSummary> {
        self.lookup(prefix).map(|index| NodeSummary {
            prefix: *prefix,
            hash: self.nodes[index].hash,
            count: self.nodes[index].count,
        })
    }

    /// The node at `prefix` and every existing descendant at most `depth`
    /// levels below it, breadth first. Empty if `prefix` does not exist.
    #[must_use]
    pub fn nodes_within(&self, prefix: &Prefix, depth: u8) -> Vec<NodeSummary> {
        let Some(start) = self.lookup(prefix) else {
            return Vec::new();
        };
        let limit = (prefix.len() + depth as usize).min(KEY_DEPTH);
        let mut out = Vec::new();
        let mut queue = VecDeque::from([(start, *prefix)]);
        while let Some((index, path)) = queue.pop_front() {
            let node = &self.nodes[index];
            out.push(NodeSummary {
                prefix: path,
                hash: node.hash,
                count: node.count,
            });
            if path.len() >= limit {
                continue;
            }
            for (digit, child) in node.children.iter().enumerate() {
                if let (Some(child), Some(child_path)) = (child, path.child(digit as u8)) {
                    queue.push_back((*child as usize, child_path));
                }
            }
        }
        out
    }

    /// Compares against another local trie and returns the minimal set of
    /// divergent ranges, from this trie's point of view.
    ///
    /// An empty side yields a single root-level range for everything.
    #[must_use]
    pub fn diff(&self, other: &MerkleTrie) -> Vec<Divergence> {
        let mut out = Vec::new();
        self.diff_nodes(Some(0), other, Some(0), Prefix::ROOT, &mut out);
        out
    }

    fn diff_nodes(
        &self,
        local: Option<usize>,
        other: &MerkleTrie,
        remote: Option<usize>,
        prefix: Prefix,
        out: &mut Vec<Divergence>,
    ) {
        let local = self.non_empty(local);
        let remote = other.non_empty(remote);
        let direction = match (local, remote) {
            (None, None) => return,
            (Some(_), None) => Direction::Push,
            (None, Some(_)) => Direction::Pull,
            (Some(l), Some(r)) => {
                let (a, b) = (&self.nodes[l], &other.nodes[r]);
                if a.hash == b.hash && a.count == b.count {
                    return;
                }
                if !prefix.is_leaf() {
                    for digit in 0..BRANCHES {
                        if let Some(child) = prefix.child(digit as u8) {
                            self.diff_nodes(
                                self.child(Some(l), digit),
                                other,
                                other.child(Some(r), digit),
                                child,
                                out,
                            );
                        }
                    }
                    return;
                }
                Direction::Both
            }
        };
        out.push(Divergence { prefix, direction });
    }

    /// Compares against a window of a remote trie.
    ///
    /// For every prefix in `frontier`, `remote` must hold the remote node at
    /// that prefix and all its descendants down to `window` levels below
    /// (exactly what [`nodes_within`](Self::nodes_within) returns on the
    /// remote side). Nodes absent from the view are taken as absent remotely.
    #[must_use]
    pub fn diff_step(&self, remote: &TrieView, frontier: &[Prefix], window: u8) -> DiffStep {
        let mut step = DiffStep::default();
        for prefix in frontier {
            let limit = (prefix.len() + window as usize).min(KEY_DEPTH);
            self.diff_view(self.lookup(prefix), remote, *prefix, limit, &mut step);
        }
        step
    }

    fn diff_view(
        &self,
        local: Option<usize>,
        remote: &TrieView,
        prefix: Prefix,
        limit: usize,
        step: &mut DiffStep,
    ) {
        let local = self.non_empty(local);
        let direction = match (local, remote.get(&prefix)) {
            (None, None) => return,
            (Some(_), None) => Direction::Push,
            (None, Some(_)) => Direction::Pull,
            (Some(l), Some(r)) => {
                let node = &self.nodes[l];
                if node.hash == r.hash && node.count == r.count {
                    return;
                }
                if prefix.is_leaf() {
                    Direction::Both
                } else if prefix.len() >= limit {
                    step.frontier.push(prefix);
                    return;
                } else {
                    for digit in 0..BRANCHES {
                        if let Some(child) = prefix.child(digit as u8) {
                            self.diff_view(self.child(Some(l), digit), remote, child, limit, step);
                        }
                    }
                    return;
                }
            }
        };
        step.divergent.push(Divergence { prefix, direction });
    }
}
