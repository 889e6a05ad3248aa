//! Verify command implementation.

use super::{load_schema, read_log, replay, CliResult};
use ledgersync_crdt::{scan_bytes, LogRecord, MerkleTrie, Schema};
use serde::Serialize;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default, Serialize)]
pub struct VerifyResult {
    /// Log file size in bytes.
    pub file_size: u64,
    /// Bytes covered by complete, valid records.
    pub valid_bytes: u64,
    /// Number of valid records.
    pub records: usize,
    /// Number of distinct messages.
    pub messages: usize,
    /// Number of clock records.
    pub clock_records: usize,
    /// True if the log ends in an incomplete record.
    pub torn_tail: bool,
    /// Rebuilt trie root hash, hex-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_hash: Option<String>,
    /// Problems found.
    pub errors: Vec<String>,
    /// Tolerated irregularities.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    /// Returns true if no errors were found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(log: &Path, schema: &Path, strict: bool) -> CliResult<()> {
    println!("Verifying log at {:?}", log);
    println!();

    let schema = load_schema(schema)?;
    let result = verify(log, &schema, strict)?;

    println!("  Records:       {}", result.records);
    println!("  Messages:      {}", result.messages);
    println!("  Clock records: {}", result.clock_records);
    println!("  Valid bytes:   {} of {}", result.valid_bytes, result.file_size);
    if let Some(root) = &result.root_hash {
        println!("  Root hash:     {root}");
    }
    for warning in &result.warnings {
        println!("  ! {warning}");
    }
    for error in &result.errors {
        println!("  ✗ {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Log verification passed");
        Ok(())
    } else {
        println!("✗ Log verification failed");
        Err("Verification failed".into())
    }
}

/// Checks every record and rebuilds the trie from the surviving messages.
///
/// I/O and schema problems are returned as errors; problems with the log
/// contents are collected in the result.
pub fn verify(log: &Path, schema: &Schema, strict: bool) -> CliResult<VerifyResult> {
    let bytes = read_log(log)?;
    let mut result = VerifyResult {
        file_size: bytes.len() as u64,
        ..VerifyResult::default()
    };

    let scan = match scan_bytes(&bytes, schema) {
        Ok(scan) => scan,
        Err(e) => {
            result.errors.push(e.to_string());
            return Ok(result);
        }
    };

    result.valid_bytes = scan.valid_len;
    result.records = scan.records.len();
    result.torn_tail = scan.torn_tail;
    result.clock_records = scan
        .records
        .iter()
        .filter(|(_, r)| matches!(r, LogRecord::Clock(_)))
        .count();

    if scan.torn_tail {
        let message = format!(
            "incomplete record at offset {} ({} trailing bytes)",
            scan.valid_len,
            result.file_size - scan.valid_len
        );
        if strict {
            result.errors.push(message);
        } else {
            result.warnings.push(message);
        }
    }

    let (store, duplicates) = replay(&scan);
    result.messages = store.len();
    if duplicates > 0 {
        result
            .warnings
            .push(format!("{duplicates} duplicate message records"));
    }

    // Insertion order must not change the trie.
    let from_store = MerkleTrie::from_messages(store.iter());
    let mut reversed: Vec<_> = store.iter().collect();
    reversed.reverse();
    let from_reversed = MerkleTrie::from_messages(reversed);
    if from_store.len() != store.len() as u64 {
        result.errors.push(format!(
            "trie holds {} messages, store holds {}",
            from_store.len(),
            store.len()
        ));
    }
    if from_reversed.root_hash() != from_store.root_hash() {
        result
            .errors
            .push("trie root depends on record order".to_string());
    }
    result.root_hash = Some(from_store.root_hash().to_hex());

    tracing::debug!(
        records = result.records,
        messages = result.messages,
        "log verified"
    );
    Ok(result)
}
