//! Crash recovery testing.
//!
//! Writes a history to a file-backed replica, damages the log the way a
//! crash or bad disk would, reopens it and checks what survives.
//!
//! ## Test Strategy
//!
//! 1. **Crash between records** - everything written survives
//! 2. **Crash mid-record** - the torn record is dropped, the rest survives
//! 3. **Corrupted record** - replay refuses the log

use crate::fixtures::{budget_schema, replica_id, row_id, TestReplica};
use ledgersync_crdt::{scan_bytes, CoreError, Replica, ReplicaConfig, SystemTimeSource};
use ledgersync_storage::FileBackend;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

/// Where the simulated crash hits the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// After the last complete record.
    BetweenRecords,
    /// Partway through the last record.
    MidRecord,
    /// One payload byte of the last record flipped.
    CorruptRecord,
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether recovery behaved as expected.
    pub passed: bool,
    /// What was tested.
    pub description: String,
    /// Messages expected after reopening.
    pub expected_messages: usize,
    /// Messages found after reopening.
    pub actual_messages: usize,
    /// Error from reopening, if any.
    pub error: Option<String>,
}

/// Drives crash scenarios against one file-backed replica.
pub struct CrashRecoveryHarness {
    replica: TestReplica,
    written: usize,
}

impl CrashRecoveryHarness {
    /// Creates a harness whose replica holds `messages` local writes.
    pub fn new(messages: usize) -> Self {
        let replica = TestReplica::file(1);
        for n in 0..messages {
            replica.advance(1);
            replica
                .write("transactions", row_id(n as u64 % 7), "amount", n as i64)
                .expect("Failed to write");
        }
        replica.sync().expect("Failed to sync log");
        Self {
            replica,
            written: messages,
        }
    }

    /// Damages the log at `point`, reopens it and reports.
    pub fn simulate(self, point: CrashPoint) -> CrashRecoveryResult {
        let path = self.replica.log_path().expect("harness replica is file-backed");
        let bytes = std::fs::read(&path).expect("Failed to read log");
        let scan = scan_bytes(&bytes, &budget_schema()).expect("log is valid before the crash");
        let last = scan.records.last().map(|(offset, _)| *offset).unwrap_or(0);
        // Keep the temp directory alive while reopening.
        let replica = self.replica;

        let (expected, description) = match point {
            CrashPoint::BetweenRecords => (self.written, "crash between records"),
            CrashPoint::MidRecord => {
                set_len(&path, last + (bytes.len() as u64 - last) / 2);
                (self.written - 1, "crash mid-record")
            }
            CrashPoint::CorruptRecord => {
                flip_byte(&path, bytes.len() as u64 - 6);
                (0, "corrupted record")
            }
        };

        let mut result = CrashRecoveryResult {
            passed: false,
            description: description.to_string(),
            expected_messages: expected,
            actual_messages: 0,
            error: None,
        };
        match reopen(&path) {
            Ok(recovered) => {
                result.actual_messages = recovered.message_count();
                result.passed = point != CrashPoint::CorruptRecord
                    && result.actual_messages == expected
                    && recovered.verify_trie();
            }
            Err(err) => {
                result.passed = matches!(point, CrashPoint::CorruptRecord)
                    && matches!(err, CoreError::LogCorruption { .. });
                result.error = Some(err.to_string());
            }
        }
        drop(replica);
        result
    }

    /// Runs every crash point against fresh harnesses.
    pub fn run_all(messages: usize) -> Vec<CrashRecoveryResult> {
        [CrashPoint::BetweenRecords, CrashPoint::MidRecord, CrashPoint::CorruptRecord]
            .into_iter()
            .map(|point| Self::new(messages).simulate(point))
            .collect()
    }
}

fn reopen(path: &Path) -> Result<Replica, CoreError> {
    let backend = FileBackend::open(path)?;
    Replica::open(
        replica_id(1),
        budget_schema(),
        Box::new(backend),
        ReplicaConfig::default(),
        Arc::new(SystemTimeSource),
    )
}

/// Truncates a file to `len` bytes.
pub fn set_len(path: &Path, len: u64) {
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_len(len))
        .expect("Failed to truncate file");
}

/// Inverts the byte at `offset`.
pub fn flip_byte(path: &Path, offset: u64) {
    let mut bytes = std::fs::read(path).expect("Failed to read file");
    bytes[offset as usize] = !bytes[offset as usize];
    std::fs::write(path, bytes).expect("Failed to write file");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_crash_point_recovers_as_expected() {
        for result in CrashRecoveryHarness::run_all(20) {
            assert!(result.passed, "{result:?}");
        }
    }

    #[test]
    fn torn_tail_keeps_earlier_messages() {
        let result = CrashRecoveryHarness::new(5).simulate(CrashPoint::MidRecord);
        assert_eq!(result.actual_messages, 4);
        assert!(result.error.is_none());
    }
}
