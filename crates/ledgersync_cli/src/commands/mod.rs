//! CLI command implementations.

pub mod diff;
pub mod dump_log;
pub mod inspect;
pub mod verify;

use chrono::{TimeZone, Utc};
use ledgersync_crdt::{scan_bytes, LogRecord, LogScan, MessageStore, Schema};
use ledgersync_storage::{FileBackend, StorageBackend};
use std::path::Path;

/// Error type shared by every command.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Reads and parses a schema file.
pub fn load_schema(path: &Path) -> CliResult<Schema> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read schema {}: {e}", path.display()))?;
    Ok(Schema::from_json(&text)?)
}

/// Reads a whole log file.
pub fn read_log(path: &Path) -> CliResult<Vec<u8>> {
    let backend = FileBackend::open_existing(path)?;
    let bytes = backend.read_all()?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "read log");
    Ok(bytes)
}

/// Reads and scans a log, failing on the first corrupt record.
pub fn scan_log(path: &Path, schema: &Schema) -> CliResult<LogScan> {
    let bytes = read_log(path)?;
    Ok(scan_bytes(&bytes, schema)?)
}

/// Rebuilds the message store a replica would hold after replaying `scan`.
///
/// Returns the store and the number of duplicate message records.
pub fn replay(scan: &LogScan) -> (MessageStore, usize) {
    let mut store = MessageStore::new();
    let mut duplicates = 0;
    for (_, record) in &scan.records {
        if let LogRecord::Message(message) = record {
            if !store.append(message.clone()).is_appended() {
                duplicates += 1;
            }
        }
    }
    (store, duplicates)
}

/// Formats wall-clock millis as RFC 3339.
pub fn format_millis(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| format!("{millis}ms"))
}
