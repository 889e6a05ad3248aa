//! Change messages and their canonical wire form.
//!
//! A message records one cell write. The encoding is fixed-order big-endian:
//!
//! ```text
//! [dataset:u16][row:16][column:u16][millis:u64][counter:u16][replica:16]
//! [valueType:u8][value bytes][hasOld:u8][oldType:u8 + old bytes if hasOld]
//! ```
//!
//! Value bytes are empty for null, 8 bytes of IEEE-754 for numbers, and a
//! `u32` length followed by UTF-8 for strings. Decoders accept a missing
//! `hasOld` byte as "no old value".

use crate::clock::{ClockError, Timestamp, TIMESTAMP_LEN};
use crate::ids::{CellKey, ColumnId, DatasetId, RowId};
use crate::schema::Schema;
use crate::value::{Value, TAG_NULL, TAG_NUMBER, TAG_STRING};
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Bytes before the value payload: ids, timestamp and the value tag.
pub const FIXED_LEN: usize = 2 + 16 + 2 + TIMESTAMP_LEN + 1;

/// Result alias for message decoding.
pub type MessageResult<T> = Result<T, MessageError>;

/// Reasons a message could not be decoded. Such messages are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Input ended early.
    #[error("message truncated: needed {needed} bytes, {remaining} left")]
    Truncated {
        /// Bytes required by the next field.
        needed: usize,
        /// Bytes available.
        remaining: usize,
    },

    /// Bytes left over after a complete message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// The dataset id is not in the schema.
    #[error("unknown dataset id {0}")]
    UnknownDataset(u16),

    /// The column id is not declared for the dataset.
    #[error("unknown column id {column} in dataset {dataset}")]
    UnknownColumn {
        /// Dataset id.
        dataset: u16,
        /// Column id.
        column: u16,
    },

    /// The timestamp is out of range.
    #[error("corrupt timestamp: {0}")]
    Timestamp(ClockError),

    /// The value type byte is not 0, 1 or 2.
    #[error("unknown value type {0}")]
    UnknownValueType(u8),

    /// A number decoded to NaN.
    #[error("number is NaN")]
    NotANumber,

    /// A string is not valid UTF-8.
    #[error("string value is not valid UTF-8")]
    InvalidUtf8,

    /// The old-value flag is not 0 or 1.
    #[error("invalid old-value flag {0}")]
    InvalidOldFlag(u8),
}

/// One cell write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMessage {
    /// Dataset of the written cell.
    pub dataset: DatasetId,
    /// Row of the written cell.
    pub row: RowId,
    /// Column of the written cell.
    pub column: ColumnId,
    /// New value.
    pub value: Value,
    /// Value the writer saw before the write. Advisory only; never used to
    /// decide which write wins.
    pub old: Option<Value>,
    /// Position in the global order.
    pub timestamp: Timestamp,
}

impl ChangeMessage {
    /// Creates a message for `cell`.
    #[must_use]
    pub fn new(cell: CellKey, value: Value, timestamp: Timestamp) -> Self {
        Self {
            dataset: cell.dataset,
            row: cell.row,
            column: cell.column,
            value,
            old: None,
            timestamp,
        }
    }

    /// Attaches the advisory previous value.
    #[must_use]
    pub fn with_old(mut self, old: Option<Value>) -> Self {
        self.old = old;
        self
    }

    /// The cell this message writes.
    #[must_use]
    pub fn cell(&self) -> CellKey {
        CellKey::new(self.dataset, self.row, self.column)
    }

    /// Returns true if this message wins over `other` for the same cell.
    ///
    /// Equal timestamps mean the same message, which never wins over itself.
    #[must_use]
    pub fn supersedes(&self, other: &ChangeMessage) -> bool {
        self.timestamp > other.timestamp
    }

    /// Length of [`encode`](Self::encode) output.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let old_len = self.old.as_ref().map_or(0, value_len);
        FIXED_LEN - 1 + value_len(&self.value) + 1 + old_len
    }

    /// Encodes to the canonical form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Appends the canonical form to `buf`.
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.dataset.0);
        buf.put_slice(self.row.as_bytes());
        buf.put_u16(self.column.0);
        buf.put_slice(&self.timestamp.to_bytes());
        put_value(buf, &self.value);
        match &self.old {
            Some(old) => {
                buf.put_u8(1);
                put_value(buf, old);
            }
            None => buf.put_u8(0),
        }
    }

    /// Decodes one message, validating ids against `schema`.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] for truncated or trailing input, ids
    /// unknown to the schema, out-of-range timestamps or bad values.
    pub fn decode(bytes: &[u8], schema: &Schema) -> MessageResult<Self> {
        let mut buf = bytes;
        need(&buf, FIXED_LEN - 1)?;

        let dataset = DatasetId(buf.get_u16());
        let mut row = [0u8; 16];
        buf.copy_to_slice(&mut row);
        let column = ColumnId(buf.get_u16());
        if !schema.has_dataset(dataset) {
            return Err(MessageError::UnknownDataset(dataset.0));
        }
        if !schema.has_column(dataset, column) {
            return Err(MessageError::UnknownColumn {
                dataset: dataset.0,
                column: column.0,
            });
        }

        let timestamp =
            Timestamp::from_bytes(&buf[..TIMESTAMP_LEN]).map_err(MessageError::Timestamp)?;
        buf.advance(TIMESTAMP_LEN);

        let value = get_value(&mut buf)?;
        let old = if buf.has_remaining() {
            match buf.get_u8() {
                0 => None,
                1 => Some(get_value(&mut buf)?),
                flag => return Err(MessageError::InvalidOldFlag(flag)),
            }
        } else {
            None
        };

        if buf.has_remaining() {
            return Err(MessageError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            dataset,
            row: RowId::from_bytes(row),
            column,
            value,
            old,
            timestamp,
        })
    }
}

fn value_len(value: &Value) -> usize {
    1 + match value {
        Value::Null => 0,
        Value::Number(_) => 8,
        Value::String(s) => 4 + s.len(),
    }
}

fn put_value<B: BufMut>(buf: &mut B, value: &Value) {
    buf.put_u8(value.tag());
    match value {
        Value::Null => {}
        Value::Number(n) => buf.put_u64(n.to_bits()),
        Value::String(s) => {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
    }
}

fn get_value(buf: &mut &[u8]) -> MessageResult<Value> {
    need(buf, 1)?;
    match buf.get_u8() {
        TAG_NULL => Ok(Value::Null),
        TAG_NUMBER => {
            need(buf, 8)?;
            let n = f64::from_bits(buf.get_u64());
            if n.is_nan() {
                return Err(MessageError::NotANumber);
            }
            Ok(Value::Number(n))
        }
        TAG_STRING => {
            need(buf, 4)?;
            let len = buf.get_u32() as usize;
            need(buf, len)?;
            let text = std::str::from_utf8(&buf[..len]).map_err(|_| MessageError::InvalidUtf8)?;
            let value = Value::String(text.to_owned());
            buf.advance(len);
            Ok(value)
        }
        tag => Err(MessageError::UnknownValueType(tag)),
    }
}

fn need(buf: &&[u8], needed: usize) -> MessageResult<()> {
    if buf.len() < needed {
        return Err(MessageError::Truncated {
            needed,
            remaining: buf.len(),
        });
    }
    Ok(())
}
