//! Inspect command implementation.

use super::{load_schema, replay, scan_log, CliResult};
use ledgersync_crdt::{LogRecord, MerkleTrie, Schema};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Log inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Log path.
    pub path: String,
    /// Bytes covered by complete records.
    pub valid_bytes: u64,
    /// True if the log ends in an incomplete record.
    pub torn_tail: bool,
    /// Number of records of any type.
    pub record_count: usize,
    /// Number of distinct messages.
    pub message_count: usize,
    /// Message records repeating an earlier one.
    pub duplicate_count: usize,
    /// Number of clock records.
    pub clock_record_count: usize,
    /// Number of cells ever written.
    pub cell_count: usize,
    /// Clock the replica would restore.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock: Option<String>,
    /// Trie root hash, hex-encoded.
    pub root_hash: String,
    /// Per-dataset counts, in schema order.
    pub datasets: Vec<DatasetStats>,
}

/// Statistics for a single dataset.
#[derive(Debug, Serialize)]
pub struct DatasetStats {
    /// Dataset ID.
    pub id: u16,
    /// Dataset name.
    pub name: String,
    /// Messages written to the dataset.
    pub messages: usize,
    /// Rows with at least one written cell.
    pub rows: usize,
    /// Cells with at least one message.
    pub cells: usize,
}

/// Runs the inspect command.
pub fn run(log: &Path, schema: &Path, format: &str) -> CliResult<()> {
    let schema = load_schema(schema)?;
    let result = inspect(log, &schema)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects statistics for one log.
pub fn inspect(log: &Path, schema: &Schema) -> CliResult<InspectResult> {
    let scan = scan_log(log, schema)?;
    let (store, duplicates) = replay(&scan);
    let trie = MerkleTrie::from_messages(store.iter());

    let clock_records = scan
        .records
        .iter()
        .filter(|(_, r)| matches!(r, LogRecord::Clock(_)))
        .count();
    let clock = scan.records.iter().map(|(_, r)| r.timestamp()).max();

    let mut per_dataset: BTreeMap<u16, (usize, HashSet<_>, usize)> = BTreeMap::new();
    for entry in store.entries() {
        let stats = per_dataset
            .entry(entry.message.dataset.0)
            .or_insert_with(|| (0, HashSet::new(), 0));
        stats.0 += 1;
        stats.1.insert(entry.message.row);
        if entry.is_winner {
            stats.2 += 1;
        }
    }

    let datasets = schema
        .datasets()
        .iter()
        .map(|def| {
            let (messages, rows, cells) = per_dataset
                .remove(&def.id)
                .map(|(m, r, c)| (m, r.len(), c))
                .unwrap_or_default();
            DatasetStats {
                id: def.id,
                name: def.name.clone(),
                messages,
                rows,
                cells,
            }
        })
        .collect();

    Ok(InspectResult {
        path: log.display().to_string(),
        valid_bytes: scan.valid_len,
        torn_tail: scan.torn_tail,
        record_count: scan.records.len(),
        message_count: store.len(),
        duplicate_count: duplicates,
        clock_record_count: clock_records,
        cell_count: store.cell_count(),
        clock: clock.map(|ts| ts.to_string()),
        root_hash: trie.root_hash().to_hex(),
        datasets,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("ledgersync Log Inspection");
    println!("=========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Records:");
    println!("  Total:          {}", result.record_count);
    println!("  Messages:       {}", result.message_count);
    println!("  Duplicates:     {}", result.duplicate_count);
    println!("  Clock records:  {}", result.clock_record_count);
    println!("  Valid bytes:    {}", result.valid_bytes);
    if result.torn_tail {
        println!("  Torn tail:      yes (incomplete final record)");
    }
    println!();
    println!("State:");
    println!("  Cells:     {}", result.cell_count);
    println!(
        "  Clock:     {}",
        result.clock.as_deref().unwrap_or("(none)")
    );
    println!("  Root hash: {}", result.root_hash);
    println!();
    println!("Datasets:");
    for dataset in &result.datasets {
        println!(
            "  [{}] {}: {} messages, {} rows, {} cells",
            dataset.id, dataset.name, dataset.messages, dataset.rows, dataset.cells
        );
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use ledgersync_crdt::Value;

    #[test]
    fn counts_messages_per_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages.lsml");
        write_log(
            &log,
            &[
                message(1, 1, 1, BASE, Value::from(500i64)),
                message(1, 1, 1, BASE + 10, Value::from(700i64)),
                message(1, 2, 2, BASE + 20, Value::from("Grocer")),
                message(2, 3, 1, BASE + 30, Value::from("Checking")),
            ],
        );

        let result = inspect(&log, &schema()).unwrap();
        assert_eq!(result.message_count, 4);
        assert_eq!(result.cell_count, 3);
        assert!(!result.torn_tail);

        let transactions = &result.datasets[0];
        assert_eq!(transactions.name, "transactions");
        assert_eq!(transactions.messages, 3);
        assert_eq!(transactions.rows, 2);
        assert_eq!(transactions.cells, 2);
        assert_eq!(result.datasets[1].messages, 1);

        let clock = result.clock.unwrap();
        assert!(clock.starts_with("2023-11-14T22:13:20.030Z"));
    }

    #[test]
    fn empty_log_has_zero_root() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages.lsml");
        write_log(&log, &[]);

        let result = inspect(&log, &schema()).unwrap();
        assert_eq!(result.message_count, 0);
        assert!(result.clock.is_none());
        assert_eq!(result.root_hash, "0".repeat(64));
        assert!(result.datasets.iter().all(|d| d.messages == 0));
    }
}
