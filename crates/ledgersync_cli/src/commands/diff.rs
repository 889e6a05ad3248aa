//! Diff command implementation.

use super::{format_millis, load_schema, replay, scan_log, CliResult};
use ledgersync_crdt::{Direction, MerkleTrie, Schema};
use serde::Serialize;
use std::path::Path;

/// One time range where the logs disagree.
#[derive(Debug, Serialize)]
pub struct RangeDiff {
    /// Trie prefix of the range.
    pub prefix: String,
    /// Which side holds messages the other lacks: `local`, `other` or `both`.
    pub ahead: String,
    /// Range start, inclusive.
    pub from: String,
    /// Range end, exclusive.
    pub to: String,
    /// Messages the first log holds in the range.
    pub local_messages: usize,
    /// Messages the second log holds in the range.
    pub other_messages: usize,
}

/// Comparison of two logs.
#[derive(Debug, Serialize)]
pub struct DiffResult {
    /// Root hash of the first log's trie.
    pub local_root: String,
    /// Root hash of the second log's trie.
    pub other_root: String,
    /// Divergent ranges in time order.
    pub ranges: Vec<RangeDiff>,
}

impl DiffResult {
    /// Returns true if both logs hold the same messages.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Runs the diff command.
pub fn run(log: &Path, other: &Path, schema: &Path, format: &str) -> CliResult<()> {
    let schema = load_schema(schema)?;
    let result = diff(log, other, &schema)?;

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

/// Compares the messages of two logs.
pub fn diff(log: &Path, other: &Path, schema: &Schema) -> CliResult<DiffResult> {
    let (local, _) = replay(&scan_log(log, schema)?);
    let (remote, _) = replay(&scan_log(other, schema)?);
    let local_trie = MerkleTrie::from_messages(local.iter());
    let remote_trie = MerkleTrie::from_messages(remote.iter());

    let mut divergences = local_trie.diff(&remote_trie);
    divergences.sort_by_key(|d| d.prefix.millis_range().start);

    let ranges = divergences
        .into_iter()
        .map(|d| {
            let millis = d.prefix.millis_range();
            let ahead = match d.direction {
                Direction::Push => "local",
                Direction::Pull => "other",
                Direction::Both => "both",
            };
            RangeDiff {
                prefix: d.prefix.to_string(),
                ahead: ahead.to_string(),
                from: format_millis(millis.start),
                to: format_millis(millis.end),
                local_messages: local.messages_in_prefix(&d.prefix).count(),
                other_messages: remote.messages_in_prefix(&d.prefix).count(),
            }
        })
        .collect();

    Ok(DiffResult {
        local_root: local_trie.root_hash().to_hex(),
        other_root: remote_trie.root_hash().to_hex(),
        ranges,
    })
}

fn print_text_output(result: &DiffResult) {
    println!("Local root: {}", result.local_root);
    println!("Other root: {}", result.other_root);
    println!();

    if result.is_converged() {
        println!("✓ Logs hold the same messages");
        return;
    }

    println!(
        "{:<22}  {:<5}  {:<20}  {:<20}  {:>6}  {:>6}",
        "PREFIX", "AHEAD", "FROM", "TO", "LOCAL", "OTHER"
    );
    for range in &result.ranges {
        println!(
            "{:<22}  {:<5}  {:<20}  {:<20}  {:>6}  {:>6}",
            range.prefix,
            range.ahead,
            range.from,
            range.to,
            range.local_messages,
            range.other_messages
        );
    }
    println!();
    println!("✗ {} divergent ranges", result.ranges.len());
}
