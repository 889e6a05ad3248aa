//! The message history and per-cell winners.

use crate::clock::Timestamp;
use crate::ids::{CellKey, ColumnId, DatasetId, RowId};
use crate::merkle::Prefix;
use crate::message::ChangeMessage;
use crate::value::Value;
use std::collections::BTreeMap;

/// Result of [`MessageStore::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The message is new and was stored.
    Appended,
    /// A message with the same timestamp and cell was already stored.
    AlreadyPresent,
}

impl AppendOutcome {
    /// Returns true for [`AppendOutcome::Appended`].
    #[must_use]
    pub fn is_appended(self) -> bool {
        self == AppendOutcome::Appended
    }
}

/// A stored message together with whether it currently decides its cell.
#[derive(Debug, Clone, Copy)]
pub struct StoreEntry<'a> {
    /// The message.
    pub message: &'a ChangeMessage,
    /// True if no stored message for the same cell has a greater timestamp.
    pub is_winner: bool,
}

/// Every message a replica has accepted, ordered by timestamp.
///
/// Messages are identified by `(timestamp, cell)`; a second message with the
/// same identity is ignored even if its value differs. A cell's value is the
/// value of its greatest-timestamp message, so any arrival order of the same
/// set of messages leaves the same values.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: BTreeMap<(Timestamp, CellKey), ChangeMessage>,
    winners: BTreeMap<CellKey, Timestamp>,
}

impl MessageStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a message and updates its cell's winner.
    pub fn append(&mut self, message: ChangeMessage) -> AppendOutcome {
        let cell = message.cell();
        let key = (message.timestamp, cell);
        if self.messages.contains_key(&key) {
            return AppendOutcome::AlreadyPresent;
        }
        let timestamp = message.timestamp;
        self.messages.insert(key, message);
        let winner = self.winners.entry(cell).or_insert(timestamp);
        if *winner < timestamp {
            *winner = timestamp;
        }
        AppendOutcome::Appended
    }

    /// Returns true if this exact message identity is stored.
    #[must_use]
    pub fn contains(&self, message: &ChangeMessage) -> bool {
        self.messages
            .contains_key(&(message.timestamp, message.cell()))
    }

    /// The message that currently decides `cell`.
    #[must_use]
    pub fn winner(&self, cell: &CellKey) -> Option<&ChangeMessage> {
        let timestamp = self.winners.get(cell)?;
        self.messages.get(&(*timestamp, *cell))
    }

    /// Current value of `cell`; `None` if it was never written.
    #[must_use]
    pub fn current_value(&self, cell: &CellKey) -> Option<&Value> {
        self.winner(cell).map(|m| &m.value)
    }

    /// Returns true if `message` is the stored winner of its cell.
    #[must_use]
    pub fn is_winner(&self, message: &ChangeMessage) -> bool {
        self.winners.get(&message.cell()) == Some(&message.timestamp)
    }

    /// Current values of every written column of a row, by column id.
    #[must_use]
    pub fn row(&self, dataset: DatasetId, row: RowId) -> Vec<(ColumnId, &Value)> {
        let start = CellKey::new(dataset, row, ColumnId(0));
        let end = CellKey::new(dataset, row, ColumnId(u16::MAX));
        self.winners
            .range(start..=end)
            .filter_map(|(cell, timestamp)| {
                self.messages
                    .get(&(*timestamp, *cell))
                    .map(|m| (cell.column, &m.value))
            })
            .collect()
    }

    /// Messages stamped inside the time range of a trie prefix, in order.
    pub fn messages_in_prefix(&self, prefix: &Prefix) -> impl Iterator<Item = &ChangeMessage> + '_ {
        let range = prefix.millis_range();
        let start = (Timestamp::floor(range.start), CellKey::MIN);
        let end = (Timestamp::floor(range.end), CellKey::MIN);
        self.messages.range(start..end).map(|(_, m)| m)
    }

    /// Messages with a timestamp strictly greater than `since`, in order.
    pub fn messages_since(&self, since: Timestamp) -> impl Iterator<Item = &ChangeMessage> + '_ {
        self.messages
            .range((since, CellKey::MIN)..)
            .map(|(_, m)| m)
            .skip_while(move |m| m.timestamp <= since)
    }

    /// All messages in timestamp order.
    pub fn iter(&self) -> impl Iterator<Item = &ChangeMessage> + '_ {
        self.messages.values()
    }

    /// All messages in timestamp order with their winner flag.
    pub fn entries(&self) -> impl Iterator<Item = StoreEntry<'_>> + '_ {
        self.messages.values().map(|message| StoreEntry {
            message,
            is_winner: self.is_winner(message),
        })
    }

    /// Greatest stored timestamp.
    #[must_use]
    pub fn latest(&self) -> Option<Timestamp> {
        self.messages.keys().next_back().map(|(ts, _)| *ts)
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of cells ever written.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.winners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ReplicaId;
    use crate::merkle::BUCKET_MS;

    const BASE: u64 = 1_700_000_000_000;

    fn cell(column: u16) -> CellKey {
        CellKey::new(DatasetId(1), RowId::from_bytes([7; 16]), ColumnId(column))
    }

    fn msg(column: u16, millis: u64, counter: u16, value: i64) -> ChangeMessage {
        let ts = Timestamp::new(millis, counter, ReplicaId::from_bytes([1; 16]));
        ChangeMessage::new(cell(column), Value::from(value), ts)
    }

    #[test]
    fn greatest_timestamp_wins_in_any_order() {
        let older = msg(1, BASE, 0, 100);
        let newer = msg(1, BASE, 1, 200);

        let mut forward = MessageStore::new();
        forward.append(older.clone());
        forward.append(newer.clone());

        let mut backward = MessageStore::new();
        backward.append(newer.clone());
        backward.append(older.clone());

        for store in [&forward, &backward] {
            assert_eq!(store.current_value(&cell(1)), Some(&Value::from(200)));
            assert!(store.is_winner(&newer));
            assert!(!store.is_winner(&older));
            assert_eq!(store.len(), 2);
        }
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut store = MessageStore::new();
        let m = msg(1, BASE, 0, 1);
        assert_eq!(store.append(m.clone()), AppendOutcome::Appended);
        assert_eq!(store.append(m.clone()), AppendOutcome::AlreadyPresent);

        let mut conflicting = m.clone();
        conflicting.value = Value::from(2);
        assert_eq!(store.append(conflicting), AppendOutcome::AlreadyPresent);
        assert_eq!(store.current_value(&cell(1)), Some(&Value::from(1)));
        assert_eq!(store.len(), 1);
        assert!(store.contains(&m));
    }

    #[test]
    fn same_timestamp_different_cells_are_distinct() {
        let mut store = MessageStore::new();
        assert!(store.append(msg(1, BASE, 0, 1)).is_appended());
        assert!(store.append(msg(2, BASE, 0, 2)).is_appended());
        assert_eq!(store.cell_count(), 2);
    }

    #[test]
    fn row_lists_current_values() {
        let mut store = MessageStore::new();
        store.append(msg(1, BASE, 0, 1));
        store.append(msg(2, BASE, 1, 2));
        store.append(msg(1, BASE, 2, 3));
        let other_row = ChangeMessage::new(
            CellKey::new(DatasetId(1), RowId::from_bytes([8; 16]), ColumnId(1)),
            Value::Null,
            Timestamp::new(BASE, 3, ReplicaId::NIL),
        );
        store.append(other_row);

        let row = store.row(DatasetId(1), RowId::from_bytes([7; 16]));
        assert_eq!(
            row,
            vec![(ColumnId(1), &Value::from(3)), (ColumnId(2), &Value::from(2))]
        );
        assert!(store.row(DatasetId(2), RowId::from_bytes([7; 16])).is_empty());
    }

    #[test]
    fn prefix_ranges_select_by_time() {
        let mut store = MessageStore::new();
        let minute = BASE - BASE % BUCKET_MS;
        store.append(msg(1, minute - 1, 0, 1));
        store.append(msg(1, minute, 0, 2));
        store.append(msg(1, minute + BUCKET_MS - 1, 0, 3));
        store.append(msg(1, minute + BUCKET_MS, 0, 4));

        let leaf = Prefix::for_millis(minute);
        let inside: Vec<_> = store
            .messages_in_prefix(&leaf)
            .map(|m| m.value.clone())
            .collect();
        assert_eq!(inside, vec![Value::from(2), Value::from(3)]);
        assert_eq!(store.messages_in_prefix(&Prefix::ROOT).count(), 4);
    }

    #[test]
    fn messages_since_is_exclusive() {
        let mut store = MessageStore::new();
        store.append(msg(1, BASE, 0, 1));
        store.append(msg(2, BASE, 0, 2));
        store.append(msg(1, BASE, 1, 3));
        let since = Timestamp::new(BASE, 0, ReplicaId::from_bytes([1; 16]));
        let later: Vec<_> = store.messages_since(since).collect();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].value, Value::from(3));
        assert_eq!(store.messages_since(Timestamp::zero()).count(), 3);
        assert_eq!(store.latest().map(|t| t.counter()), Some(1));
    }

    #[test]
    fn entries_flag_winners() {
        let mut store = MessageStore::new();
        store.append(msg(1, BASE, 0, 1));
        store.append(msg(1, BASE, 1, 2));
        let flags: Vec<_> = store.entries().map(|e| e.is_winner).collect();
        assert_eq!(flags, vec![false, true]);
    }
}
