//! Wire forms of trie prefixes and node summaries.
//!
//! ```text
//! prefix: [len:u8][digit:u8; len]
//! node:   prefix [hash:32][count:u64]
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut};
use ledgersync_crdt::{NodeSummary, Prefix, Timestamp, TrieHash, KEY_DEPTH, TIMESTAMP_LEN};

/// Largest encoded prefix.
pub const MAX_PREFIX_LEN: usize = 1 + KEY_DEPTH;

/// Encoded size of one node summary with a prefix of `prefix_len` digits.
#[must_use]
pub const fn node_len(prefix_len: usize) -> usize {
    1 + prefix_len + 32 + 8
}

pub(crate) fn need(buf: &[u8], needed: usize) -> ProtocolResult<()> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn put_timestamp<B: BufMut>(buf: &mut B, timestamp: &Timestamp) {
    buf.put_slice(&timestamp.to_bytes());
}

pub(crate) fn get_timestamp(buf: &mut &[u8]) -> ProtocolResult<Timestamp> {
    need(buf, TIMESTAMP_LEN)?;
    let timestamp = Timestamp::from_bytes(&buf[..TIMESTAMP_LEN])?;
    buf.advance(TIMESTAMP_LEN);
    Ok(timestamp)
}

/// Appends one prefix.
pub fn put_prefix<B: BufMut>(buf: &mut B, prefix: &Prefix) {
    buf.put_u8(prefix.len() as u8);
    buf.put_slice(prefix.digits());
}

/// Reads one prefix.
///
/// # Errors
///
/// Truncated input, or a length or digit out of range.
pub fn get_prefix(buf: &mut &[u8]) -> ProtocolResult<Prefix> {
    need(buf, 1)?;
    let len = buf.get_u8() as usize;
    if len > KEY_DEPTH {
        return Err(ProtocolError::InvalidPrefix(format!("length {len}")));
    }
    need(buf, len)?;
    let prefix = Prefix::from_digits(&buf[..len])
        .ok_or_else(|| ProtocolError::InvalidPrefix(format!("digits {:?}", &buf[..len])))?;
    buf.advance(len);
    Ok(prefix)
}

/// Appends a `u16`-counted prefix list.
///
/// # Errors
///
/// More than `u16::MAX` prefixes.
pub fn put_prefixes<B: BufMut>(buf: &mut B, prefixes: &[Prefix]) -> ProtocolResult<()> {
    let count = u16::try_from(prefixes.len()).map_err(|_| ProtocolError::TooLarge {
        what: "prefix list",
        len: prefixes.len(),
    })?;
    buf.put_u16(count);
    for prefix in prefixes {
        put_prefix(buf, prefix);
    }
    Ok(())
}

/// Reads a `u16`-counted prefix list.
///
/// # Errors
///
/// See [`get_prefix`].
pub fn get_prefixes(buf: &mut &[u8]) -> ProtocolResult<Vec<Prefix>> {
    need(buf, 2)?;
    let count = buf.get_u16() as usize;
    let mut prefixes = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        prefixes.push(get_prefix(buf)?);
    }
    Ok(prefixes)
}

/// Appends one node summary.
pub fn put_node<B: BufMut>(buf: &mut B, node: &NodeSummary) {
    put_prefix(buf, &node.prefix);
    buf.put_slice(node.hash.as_bytes());
    buf.put_u64(node.count);
}

/// Reads one node summary.
///
/// # Errors
///
/// Truncated input or a bad prefix.
pub fn get_node(buf: &mut &[u8]) -> ProtocolResult<NodeSummary> {
    let prefix = get_prefix(buf)?;
    need(buf, 32 + 8)?;
    let mut hash = [0u8; 32];
    buf.copy_to_slice(&mut hash);
    let count = buf.get_u64();
    Ok(NodeSummary {
        prefix,
        hash: TrieHash::from_bytes(hash),
        count,
    })
}

/// Appends a `u32`-counted node list.
///
/// # Errors
///
/// More than `u32::MAX` nodes.
pub fn put_nodes<B: BufMut>(buf: &mut B, nodes: &[NodeSummary]) -> ProtocolResult<()> {
    let count = u32::try_from(nodes.len()).map_err(|_| ProtocolError::TooLarge {
        what: "node list",
        len: nodes.len(),
    })?;
    buf.put_u32(count);
    for node in nodes {
        put_node(buf, node);
    }
    Ok(())
}

/// Reads a `u32`-counted node list.
///
/// # Errors
///
/// See [`get_node`].
pub fn get_nodes(buf: &mut &[u8]) -> ProtocolResult<Vec<NodeSummary>> {
    need(buf, 4)?;
    let count = buf.get_u32() as usize;
    let mut nodes = Vec::with_capacity(count.min(buf.remaining() / node_len(0)));
    for _ in 0..count {
        nodes.push(get_node(buf)?);
    }
    Ok(nodes)
}
