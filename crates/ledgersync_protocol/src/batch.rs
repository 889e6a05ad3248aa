//! Message batches.
//!
//! A batch is `[count:u32]` followed by `count` entries of
//! `[len:u32][encoded message]`. Entries stay encoded until the receiver
//! decodes them against its schema, so one malformed message costs only
//! itself.

use crate::error::{ProtocolError, ProtocolResult};
use crate::trie::need;
use bytes::{Buf, BufMut, Bytes};
use ledgersync_crdt::{ChangeMessage, MessageError, Schema};

/// Encoded messages travelling together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBatch {
    entries: Vec<Bytes>,
}

/// Result of decoding a batch: good messages and per-entry failures.
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    /// Messages that decoded.
    pub messages: Vec<ChangeMessage>,
    /// Index and reason of every entry that did not.
    pub errors: Vec<(usize, MessageError)>,
}

impl MessageBatch {
    /// An empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes messages into a batch.
    pub fn from_messages<'a>(messages: impl IntoIterator<Item = &'a ChangeMessage>) -> Self {
        Self {
            entries: messages
                .into_iter()
                .map(|m| Bytes::from(m.encode()))
                .collect(),
        }
    }

    /// Wraps already-encoded entries.
    #[must_use]
    pub fn from_entries(entries: Vec<Bytes>) -> Self {
        Self { entries }
    }

    /// Adds one message.
    pub fn push(&mut self, message: &ChangeMessage) {
        self.entries.push(Bytes::from(message.encode()));
    }

    /// Raw entries.
    #[must_use]
    pub fn entries(&self) -> &[Bytes] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the batch has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decodes every entry against `schema`, keeping the failures apart.
    #[must_use]
    pub fn decode_batch(&self, schema: &Schema) -> DecodedBatch {
        let mut decoded = DecodedBatch::default();
        for (index, entry) in self.entries.iter().enumerate() {
            match ChangeMessage::decode(entry, schema) {
                Ok(message) => decoded.messages.push(message),
                Err(err) => decoded.errors.push((index, err)),
            }
        }
        decoded
    }

    /// Encoded size.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        4 + self.entries.iter().map(|e| 4 + e.len()).sum::<usize>()
    }

    /// Appends the wire form.
    ///
    /// # Errors
    ///
    /// An entry or the entry count does not fit a `u32`.
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) -> ProtocolResult<()> {
        buf.put_u32(u32_len("message batch", self.entries.len())?);
        for entry in &self.entries {
            buf.put_u32(u32_len("message", entry.len())?);
            buf.put_slice(entry);
        }
        Ok(())
    }

    /// Reads the wire form.
    ///
    /// # Errors
    ///
    /// Truncated input. Entry contents are not checked here.
    pub fn decode_from(buf: &mut &[u8]) -> ProtocolResult<Self> {
        need(buf, 4)?;
        let count = buf.get_u32() as usize;
        let mut entries = Vec::with_capacity(count.min(buf.remaining() / 4));
        for _ in 0..count {
            need(buf, 4)?;
            let len = buf.get_u32() as usize;
            need(buf, len)?;
            entries.push(Bytes::copy_from_slice(&buf[..len]));
            buf.advance(len);
        }
        Ok(Self { entries })
    }
}

fn u32_len(what: &'static str, len: usize) -> ProtocolResult<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::TooLarge { what, len })
}
