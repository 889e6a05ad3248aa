//! Dump-log command implementation.

use super::{load_schema, replay, scan_log, CliResult};
use ledgersync_crdt::{LogRecord, Schema, Value};
use serde::Serialize;
use std::path::Path;

/// Log record representation for output.
#[derive(Debug, Serialize)]
pub struct LogRecordInfo {
    /// Offset in the log file.
    pub offset: u64,
    /// Record type.
    pub record_type: String,
    /// Record timestamp in its canonical text form.
    pub timestamp: String,
    /// Dataset name (messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    /// Row ID (messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<String>,
    /// Column name (messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    /// Written value (messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Value the writer replaced, if recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    /// True if the message currently decides its cell (messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<bool>,
}

/// Runs the dump-log command.
pub fn run(
    log: &Path,
    schema: &Path,
    limit: Option<usize>,
    start_offset: u64,
    format: &str,
) -> CliResult<()> {
    let schema = load_schema(schema)?;
    let records = read_records(log, &schema, start_offset, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
        }
    }

    Ok(())
}

/// Reads records starting at or after `start_offset`.
pub fn read_records(
    log: &Path,
    schema: &Schema,
    start_offset: u64,
    limit: Option<usize>,
) -> CliResult<Vec<LogRecordInfo>> {
    let scan = scan_log(log, schema)?;
    let (store, _) = replay(&scan);

    let records = scan
        .records
        .iter()
        .filter(|(offset, _)| *offset >= start_offset)
        .take(limit.unwrap_or(usize::MAX))
        .map(|(offset, record)| match record {
            LogRecord::Message(m) => LogRecordInfo {
                offset: *offset,
                record_type: "message".to_string(),
                timestamp: m.timestamp.to_string(),
                dataset: Some(
                    schema
                        .dataset_name(m.dataset)
                        .map_or_else(|| m.dataset.to_string(), |n| n.to_string()),
                ),
                row: Some(m.row.to_string()),
                column: Some(
                    schema
                        .column_name(m.dataset, m.column)
                        .map_or_else(|| m.column.to_string(), |n| n.to_string()),
                ),
                value: Some(m.value.clone()),
                old: m.old.clone(),
                winner: Some(store.is_winner(m)),
            },
            LogRecord::Clock(ts) => LogRecordInfo {
                offset: *offset,
                record_type: "clock".to_string(),
                timestamp: ts.to_string(),
                dataset: None,
                row: None,
                column: None,
                value: None,
                old: None,
                winner: None,
            },
        })
        .collect();

    Ok(records)
}

fn print_text_output(records: &[LogRecordInfo]) {
    println!("{:>10}  {:<7}  {:<60}  DETAILS", "OFFSET", "TYPE", "TIMESTAMP");
    println!("{}", "-".repeat(100));

    for record in records {
        let details = match (&record.dataset, &record.column, &record.value) {
            (Some(dataset), Some(column), Some(value)) => {
                let row = record.row.as_deref().unwrap_or("?");
                let marker = if record.winner == Some(true) { "*" } else { "" };
                format!("{dataset}.{column} [{row}] = {value}{marker}")
            }
            _ => String::new(),
        };
        println!(
            "{:>10}  {:<7}  {:<60}  {}",
            record.offset, record.record_type, record.timestamp, details
        );
    }

    println!();
    println!("Total: {} records (* = current value)", records.len());
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn sample(dir: &Path) -> std::path::PathBuf {
        let log = dir.join("messages.lsml");
        write_log(
            &log,
            &[
                message(1, 1, 1, BASE, Value::from(500i64)),
                message(1, 1, 1, BASE + 10, Value::from(700i64)),
                message(2, 2, 1, BASE + 5, Value::from("Savings")),
            ],
        );
        log
    }

    #[test]
    fn records_carry_names_and_winner_flags() {
        let dir = tempfile::tempdir().unwrap();
        let log = sample(dir.path());

        let records = read_records(&log, &schema(), 0, None).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[0].dataset.as_deref(), Some("transactions"));
        assert_eq!(records[0].column.as_deref(), Some("amount"));
        assert_eq!(records[0].winner, Some(false));
        assert_eq!(records[1].winner, Some(true));
        assert_eq!(records[2].dataset.as_deref(), Some("accounts"));
        assert_eq!(records[2].column.as_deref(), Some("name"));
    }

    #[test]
    fn offset_and_limit_select_a_window() {
        let dir = tempfile::tempdir().unwrap();
        let log = sample(dir.path());
        let all = read_records(&log, &schema(), 0, None).unwrap();

        let window = read_records(&log, &schema(), all[1].offset, Some(1)).unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].offset, all[1].offset);

        let past_end = read_records(&log, &schema(), u64::MAX, None).unwrap();
        assert!(past_end.is_empty());
    }

    #[test]
    fn json_omits_absent_fields() {
        let dir = tempfile::tempdir().unwrap();
        let log = sample(dir.path());
        let records = read_records(&log, &schema(), 0, Some(1)).unwrap();

        let json = serde_json::to_value(&records).unwrap();
        let first = &json[0];
        assert_eq!(first["record_type"], "message");
        assert_eq!(first["value"], 500.0);
        assert!(first.get("old").is_none());
    }
}
