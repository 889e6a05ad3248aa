//! Durable message log.
//!
//! Every accepted message, and every clock advance caused by a peer, is
//! appended here before it becomes visible. On open the log is replayed to
//! rebuild the store, the trie and the clock.
//!
//! Record layout, little-endian:
//!
//! ```text
//! | magic "LSML" (4) | version u16 | type u8 | len u32 | payload | crc32 u32 |
//! ```
//!
//! The CRC covers everything before it. A record cut short at the end of the
//! log is a torn write and is truncated away; a complete record with a bad
//! magic, version, type or checksum is corruption.

use crate::clock::{Timestamp, TIMESTAMP_LEN};
use crate::error::{CoreError, CoreResult};
use crate::message::ChangeMessage;
use crate::schema::Schema;
use ledgersync_storage::StorageBackend;
use tracing::{debug, warn};

/// Magic bytes opening every record.
pub const LOG_MAGIC: [u8; 4] = *b"LSML";

/// Current record format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// Kinds of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// An accepted change message.
    Message = 1,
    /// A clock value adopted from a peer.
    Clock = 2,
}

impl LogRecordType {
    /// Wire byte.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parses a wire byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Message),
            2 => Some(Self::Clock),
            _ => None,
        }
    }
}

/// One log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// An accepted change message.
    Message(ChangeMessage),
    /// A clock value adopted from a peer.
    Clock(Timestamp),
}

impl LogRecord {
    /// The record's type.
    #[must_use]
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::Message(_) => LogRecordType::Message,
            Self::Clock(_) => LogRecordType::Clock,
        }
    }

    /// Timestamp carried by the record.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Message(m) => m.timestamp,
            Self::Clock(ts) => *ts,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::Message(m) => m.encode(),
            Self::Clock(ts) => ts.to_bytes().to_vec(),
        }
    }

    fn decode_payload(
        record_type: LogRecordType,
        payload: &[u8],
        schema: &Schema,
    ) -> CoreResult<Self> {
        match record_type {
            LogRecordType::Message => Ok(Self::Message(ChangeMessage::decode(payload, schema)?)),
            LogRecordType::Clock => {
                if payload.len() != TIMESTAMP_LEN {
                    return Err(CoreError::invalid_value(format!(
                        "clock record of {} bytes",
                        payload.len()
                    )));
                }
                Ok(Self::Clock(Timestamp::from_bytes(payload)?))
            }
        }
    }

    /// Frames the record for appending.
    ///
    /// # Errors
    ///
    /// Fails if the payload does not fit a `u32` length.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = self.encode_payload();
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_value("log record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(self.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

/// Result of scanning log bytes.
#[derive(Debug, Clone, Default)]
pub struct LogScan {
    /// Complete records with their byte offsets.
    pub records: Vec<(u64, LogRecord)>,
    /// Length of the prefix made of complete records.
    pub valid_len: u64,
    /// True if bytes after `valid_len` form an incomplete record.
    pub torn_tail: bool,
}

impl LogScan {
    /// Number of message records.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.records
            .iter()
            .filter(|(_, r)| matches!(r, LogRecord::Message(_)))
            .count()
    }
}

/// Parses log bytes without touching any backend.
///
/// # Errors
///
/// [`CoreError::LogCorruption`] for a complete record that fails validation.
pub fn scan_bytes(bytes: &[u8], schema: &Schema) -> CoreResult<LogScan> {
    let mut scan = LogScan::default();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let offset = pos as u64;
        let rest = &bytes[pos..];
        if rest.len() < HEADER_SIZE {
            scan.torn_tail = true;
            break;
        }
        if rest[..4] != LOG_MAGIC {
            return Err(CoreError::log_corruption(offset, "bad magic"));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version > LOG_VERSION {
            return Err(CoreError::log_corruption(
                offset,
                format!("unsupported record version {version}"),
            ));
        }
        let type_byte = rest[6];
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            scan.torn_tail = true;
            break;
        }

        let body = &rest[..HEADER_SIZE + len];
        let stored = u32::from_le_bytes([
            rest[HEADER_SIZE + len],
            rest[HEADER_SIZE + len + 1],
            rest[HEADER_SIZE + len + 2],
            rest[HEADER_SIZE + len + 3],
        ]);
        let actual = compute_crc32(body);
        if stored != actual {
            return Err(CoreError::log_corruption(
                offset,
                format!("checksum mismatch: expected {stored:08x}, got {actual:08x}"),
            ));
        }

        let record_type = LogRecordType::from_byte(type_byte).ok_or_else(|| {
            CoreError::log_corruption(offset, format!("unknown record type {type_byte}"))
        })?;
        let record = LogRecord::decode_payload(record_type, &body[HEADER_SIZE..], schema)
            .map_err(|e| CoreError::log_corruption(offset, e.to_string()))?;

        scan.records.push((offset, record));
        pos += total;
    }

    scan.valid_len = pos as u64;
    Ok(scan)
}

/// Append-only log of messages and clock records over a storage backend.
pub struct MessageLog {
    backend: Box<dyn StorageBackend>,
    sync_on_write: bool,
}

impl MessageLog {
    /// Wraps a backend.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend,
            sync_on_write,
        }
    }

    /// Appends a record and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or the flush fails.
    pub fn append(&mut self, record: &LogRecord) -> CoreResult<u64> {
        let data = record.encode()?;
        let offset = self.backend.append(&data)?;
        if self.sync_on_write {
            self.backend.flush()?;
        }
        Ok(offset)
    }

    /// Appends a message record.
    ///
    /// # Errors
    ///
    /// See [`append`](Self::append).
    pub fn append_message(&mut self, message: &ChangeMessage) -> CoreResult<u64> {
        self.append(&LogRecord::Message(message.clone()))
    }

    /// Appends a clock record.
    ///
    /// # Errors
    ///
    /// See [`append`](Self::append).
    pub fn append_clock(&mut self, timestamp: Timestamp) -> CoreResult<u64> {
        self.append(&LogRecord::Clock(timestamp))
    }

    /// Reads every record, cutting off a torn tail.
    ///
    /// # Errors
    ///
    /// Fails on corruption before the tail or on I/O errors.
    pub fn replay(&mut self, schema: &Schema) -> CoreResult<LogScan> {
        let bytes = self.backend.read_all()?;
        let scan = scan_bytes(&bytes, schema)?;
        if scan.torn_tail {
            warn!(
                valid_len = scan.valid_len,
                discarded = bytes.len() as u64 - scan.valid_len,
                "truncating torn record at end of message log"
            );
            self.backend.truncate(scan.valid_len)?;
        }
        debug!(records = scan.records.len(), "replayed message log");
        Ok(scan)
    }

    /// Flushes buffered writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> CoreResult<()> {
        self.backend.flush()?;
        Ok(())
    }

    /// Forces the log to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> CoreResult<()> {
        self.backend.sync()?;
        Ok(())
    }

    /// Current log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }
}

impl std::fmt::Debug for MessageLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLog")
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

/// CRC-32 (IEEE) of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CellKey, ColumnId, DatasetId, ReplicaId, RowId};
    use crate::schema::DatasetDef;
    use crate::value::Value;
    use ledgersync_storage::{FileBackend, InMemoryBackend, StorageBackend};

    fn schema() -> Schema {
        Schema::new(vec![DatasetDef::new(1, "transactions").column(1, "amount")]).unwrap()
    }

    fn message(counter: u16) -> ChangeMessage {
        ChangeMessage::new(
            CellKey::new(DatasetId(1), RowId::from_bytes([3; 16]), ColumnId(1)),
            Value::from(i64::from(counter) * 100),
            Timestamp::new(1_700_000_000_000, counter, ReplicaId::from_bytes([9; 16])),
        )
    }

    fn filled(n: u16) -> (InMemoryBackend, MessageLog) {
        let backend = InMemoryBackend::new();
        let mut log = MessageLog::new(Box::new(backend.clone()), false);
        for i in 0..n {
            log.append_message(&message(i)).unwrap();
        }
        (backend, log)
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn record_type_bytes() {
        for t in [LogRecordType::Message, LogRecordType::Clock] {
            assert_eq!(LogRecordType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(LogRecordType::from_byte(0), None);
    }

    #[test]
    fn replays_what_was_appended() {
        let (_, mut log) = filled(3);
        let clock = Timestamp::new(1_700_000_000_500, 4, ReplicaId::from_bytes([1; 16]));
        log.append_clock(clock).unwrap();

        let scan = log.replay(&schema()).unwrap();
        assert!(!scan.torn_tail);
        assert_eq!(scan.records.len(), 4);
        assert_eq!(scan.message_count(), 3);
        assert_eq!(scan.records[0].0, 0);
        assert_eq!(scan.records[1].1, LogRecord::Message(message(1)));
        assert_eq!(scan.records[3].1, LogRecord::Clock(clock));
        assert_eq!(scan.valid_len, log.size().unwrap());
    }

    #[test]
    fn torn_tail_is_truncated() {
        let (backend, mut log) = filled(3);
        let full = backend.snapshot();
        let record_len = full.len() / 3;
        let mut tear = backend.clone();
        tear.truncate((full.len() - 5) as u64).unwrap();

        let scan = log.replay(&schema()).unwrap();
        assert!(scan.torn_tail);
        assert_eq!(scan.records.len(), 2);
        assert_eq!(log.size().unwrap(), (2 * record_len) as u64);

        log.append_message(&message(7)).unwrap();
        let scan = log.replay(&schema()).unwrap();
        assert!(!scan.torn_tail);
        assert_eq!(scan.records.len(), 3);
    }

    #[test]
    fn short_header_is_a_torn_tail() {
        let (backend, mut log) = filled(1);
        let len = backend.snapshot().len();
        backend.clone().append(&LOG_MAGIC[..3]).unwrap();
        let log_bytes = backend.snapshot();
        let scan = scan_bytes(&log_bytes, &schema()).unwrap();
        assert!(scan.torn_tail);
        assert_eq!(scan.valid_len, len as u64);
        assert_eq!(log.replay(&schema()).unwrap().records.len(), 1);
        assert_eq!(backend.snapshot().len(), len);
    }

    #[test]
    fn checksum_mismatch_is_corruption() {
        let (backend, mut log) = filled(3);
        let record_len = backend.snapshot().len() / 3;
        let byte = backend.snapshot()[record_len + HEADER_SIZE + 2];
        backend.corrupt_byte(record_len + HEADER_SIZE + 2, !byte);

        let err = log.replay(&schema()).unwrap_err();
        match err {
            CoreError::LogCorruption { offset, message } => {
                assert_eq!(offset, record_len as u64);
                assert!(message.contains("checksum"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn bad_magic_is_corruption() {
        let (backend, _) = filled(1);
        let mut bytes = backend.snapshot();
        bytes[0] = b'X';
        assert!(matches!(
            scan_bytes(&bytes, &schema()),
            Err(CoreError::LogCorruption { offset: 0, .. })
        ));
    }

    #[test]
    fn unknown_dataset_in_log_is_corruption() {
        let (backend, _) = filled(1);
        let other = Schema::new(vec![DatasetDef::new(2, "accounts").column(1, "name")]).unwrap();
        assert!(matches!(
            scan_bytes(&backend.snapshot(), &other),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn file_backed_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("budget.lslog");
        {
            let mut log = MessageLog::new(Box::new(FileBackend::open(&path).unwrap()), true);
            log.append_message(&message(1)).unwrap();
            log.append_message(&message(2)).unwrap();
            log.sync().unwrap();
        }
        let mut log = MessageLog::new(Box::new(FileBackend::open(&path).unwrap()), true);
        let scan = log.replay(&schema()).unwrap();
        assert_eq!(scan.records.len(), 2);
        assert_eq!(scan.records[1].1.timestamp().counter(), 2);
    }
}
