//! Applying batches of remote messages.

use crate::clock::{LogicalClock, Timestamp};
use crate::error::{CoreError, CoreResult};
use crate::ids::CellKey;
use crate::log::MessageLog;
use crate::merkle::MerkleTrie;
use crate::message::ChangeMessage;
use crate::schema::Schema;
use crate::store::MessageStore;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Whether a merge is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeState {
    /// No merge in progress.
    #[default]
    Idle,
    /// A batch is being applied.
    Merging,
}

/// A cell whose current value changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellChange {
    /// The cell.
    pub cell: CellKey,
    /// Dataset name.
    pub dataset: Arc<str>,
    /// Column name.
    pub column: Arc<str>,
    /// New current value.
    pub value: Value,
}

/// Counts and visible effects of one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// One entry per cell whose current value changed, in cell order.
    pub changes: Vec<CellChange>,
    /// Messages stored for the first time.
    pub applied: usize,
    /// Messages already present.
    pub duplicates: usize,
    /// Messages refused by the clock or the schema.
    pub rejected: usize,
}

impl ApplyOutcome {
    /// Adds another outcome's counts and changes.
    pub fn absorb(&mut self, other: ApplyOutcome) {
        self.changes.extend(other.changes);
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.rejected += other.rejected;
    }
}

/// Replica state a merge writes to.
pub struct MergeContext<'a> {
    /// Message history.
    pub store: &'a mut MessageStore,
    /// Merkle trie over the history.
    pub trie: &'a mut MerkleTrie,
    /// The replica clock.
    pub clock: &'a mut LogicalClock,
    /// Durable log, if the replica has one.
    pub log: Option<&'a mut MessageLog>,
}

/// Applies remote message batches.
///
/// A batch is sorted by timestamp, then each message in turn advances the
/// clock, is logged, stored and hashed into the trie. A message the clock
/// refuses is skipped without affecting the rest. Messages that lose to a
/// newer write of the same cell are still stored and hashed, they just
/// leave the cell's value alone.
#[derive(Debug, Default)]
pub struct MergeEngine {
    state: MergeState,
    batches: u64,
}

impl MergeEngine {
    /// A fresh engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> MergeState {
        self.state
    }

    /// Number of batches merged so far.
    #[must_use]
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Merges `messages` into `ctx`.
    ///
    /// # Errors
    ///
    /// [`CoreError::MergeInProgress`] if called while merging, or a storage
    /// error from the log. Messages merged before a log failure stay merged.
    pub fn apply(
        &mut self,
        ctx: MergeContext<'_>,
        messages: Vec<ChangeMessage>,
        wall_ms: u64,
        schema: &Schema,
    ) -> CoreResult<ApplyOutcome> {
        if self.state == MergeState::Merging {
            return Err(CoreError::MergeInProgress);
        }
        self.state = MergeState::Merging;
        let result = merge_batch(ctx, messages, wall_ms, schema);
        self.state = MergeState::Idle;
        if result.is_ok() {
            self.batches += 1;
        }
        result
    }
}

fn merge_batch(
    ctx: MergeContext<'_>,
    mut messages: Vec<ChangeMessage>,
    wall_ms: u64,
    schema: &Schema,
) -> CoreResult<ApplyOutcome> {
    let MergeContext {
        store,
        trie,
        clock,
        mut log,
    } = ctx;
    messages.sort_by_key(|m| m.timestamp);

    let mut outcome = ApplyOutcome::default();
    let mut before: BTreeMap<CellKey, Option<Value>> = BTreeMap::new();
    let clock_before = clock.last();
    let mut newest: Option<Timestamp> = None;

    for message in messages {
        if !schema.has_column(message.dataset, message.column) {
            warn!(
                dataset = message.dataset.0,
                column = message.column.0,
                "dropping message for undeclared column"
            );
            outcome.rejected += 1;
            continue;
        }
        if store.contains(&message) {
            outcome.duplicates += 1;
            continue;
        }
        if let Err(err) = clock.check_skew(&message.timestamp, wall_ms) {
            warn!(timestamp = %message.timestamp, error = %err, "rejecting remote message");
            outcome.rejected += 1;
            continue;
        }
        newest = Some(message.timestamp);

        let cell = message.cell();
        before
            .entry(cell)
            .or_insert_with(|| store.current_value(&cell).cloned());
        if let Some(log) = log.as_deref_mut() {
            log.append_message(&message)?;
        }
        trie.insert(&message);
        store.append(message);
        outcome.applied += 1;
    }

    // One merge per batch; the counter only has to clear the newest message.
    if let Some(newest) = newest {
        if let Err(err) = clock.merge(&newest, wall_ms) {
            warn!(timestamp = %newest, error = %err, "clock not advanced past merged batch");
        }
    }

    if let Some(log) = log {
        if clock.last() != clock_before {
            log.append_clock(clock.last())?;
        }
    }

    outcome.changes = before
        .into_iter()
        .filter_map(|(cell, old)| {
            let value = store.current_value(&cell)?;
            if old.as_ref() == Some(value) {
                return None;
            }
            Some(CellChange {
                cell,
                dataset: Arc::clone(schema.dataset_name(cell.dataset)?),
                column: Arc::clone(schema.column_name(cell.dataset, cell.column)?),
                value: value.clone(),
            })
        })
        .collect();

    debug!(
        applied = outcome.applied,
        duplicates = outcome.duplicates,
        rejected = outcome.rejected,
        changed = outcome.changes.len(),
        clock = %clock.last(),
        "merged remote batch"
    );
    Ok(outcome)
}

/// Latest timestamp among `messages`, if any.
#[must_use]
pub fn latest_timestamp<'a>(messages: impl IntoIterator<Item = &'a ChangeMessage>) -> Option<Timestamp> {
    messages.into_iter().map(|m| m.timestamp).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ColumnId, DatasetId, ReplicaId, RowId};
    use crate::log::LogRecord;
    use crate::schema::DatasetDef;
    use ledgersync_storage::InMemoryBackend;

    const WALL: u64 = 1_700_000_000_000;

    struct Fixture {
        store: MessageStore,
        trie: MerkleTrie,
        clock: LogicalClock,
        engine: MergeEngine,
        schema: Schema,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: MessageStore::new(),
                trie: MerkleTrie::new(),
                clock: LogicalClock::new(ReplicaId::from_bytes([0xAA; 16])),
                engine: MergeEngine::new(),
                schema: Schema::new(vec![DatasetDef::new(1, "transactions")
                    .column(1, "amount")
                    .column(2, "payee")])
                .unwrap(),
            }
        }

        fn apply(&mut self, messages: Vec<ChangeMessage>) -> ApplyOutcome {
            self.apply_logged(messages, None)
        }

        fn apply_logged(
            &mut self,
            messages: Vec<ChangeMessage>,
            log: Option<&mut MessageLog>,
        ) -> ApplyOutcome {
            let ctx = MergeContext {
                store: &mut self.store,
                trie: &mut self.trie,
                clock: &mut self.clock,
                log,
            };
            self.engine.apply(ctx, messages, WALL, &self.schema).unwrap()
        }
    }

    fn msg(column: u16, millis: u64, counter: u16, value: i64) -> ChangeMessage {
        ChangeMessage::new(
            CellKey::new(DatasetId(1), RowId::from_bytes([1; 16]), ColumnId(column)),
            Value::from(value),
            Timestamp::new(millis, counter, ReplicaId::from_bytes([0xBB; 16])),
        )
    }

    #[test]
    fn newest_message_per_cell_wins_regardless_of_batch_order() {
        let mut fx = Fixture::new();
        let outcome = fx.apply(vec![msg(1, WALL, 2, 300), msg(1, WALL, 1, 200), msg(2, WALL, 0, 9)]);
        assert_eq!(outcome.applied, 3);
        assert_eq!(outcome.changes.len(), 2);
        assert_eq!(outcome.changes[0].value, Value::from(300));
        assert_eq!(&*outcome.changes[0].column, "amount");
        assert_eq!(&*outcome.changes[1].column, "payee");
        assert_eq!(fx.trie.len(), 3);
        assert_eq!(fx.engine.state(), MergeState::Idle);
        assert_eq!(fx.engine.batches(), 1);
    }

    #[test]
    fn reapplying_is_a_no_op() {
        let mut fx = Fixture::new();
        let batch = vec![msg(1, WALL, 0, 1), msg(2, WALL, 1, 2)];
        fx.apply(batch.clone());
        let root = fx.trie.root_hash();
        let clock = fx.clock.last();

        let outcome = fx.apply(batch);
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.duplicates, 2);
        assert!(outcome.changes.is_empty());
        assert_eq!(fx.trie.root_hash(), root);
        assert_eq!(fx.clock.last(), clock);
    }

    #[test]
    fn older_message_is_stored_but_not_visible() {
        let mut fx = Fixture::new();
        fx.apply(vec![msg(1, WALL, 5, 500)]);
        let outcome = fx.apply(vec![msg(1, WALL, 1, 100)]);
        assert_eq!(outcome.applied, 1);
        assert!(outcome.changes.is_empty());
        assert_eq!(fx.store.len(), 2);
        assert_eq!(fx.trie.len(), 2);
        assert_eq!(
            fx.store
                .current_value(&msg(1, 0, 0, 0).cell())
                .cloned(),
            Some(Value::from(500))
        );
    }

    #[test]
    fn clock_refusal_skips_only_that_message() {
        let mut fx = Fixture::new();
        let far_future = WALL + 10 * 60 * 1000;
        let outcome = fx.apply(vec![msg(1, WALL, 0, 1), msg(2, far_future, 0, 2)]);
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(fx.store.len(), 1);
        assert!(fx.clock.last().millis() < far_future);
    }

    #[test]
    fn undeclared_columns_are_rejected() {
        let mut fx = Fixture::new();
        let outcome = fx.apply(vec![msg(9, WALL, 0, 1)]);
        assert_eq!(outcome.rejected, 1);
        assert!(fx.store.is_empty());
    }

    #[test]
    fn clock_moves_past_every_merged_message() {
        let mut fx = Fixture::new();
        fx.apply(vec![msg(1, WALL + 1_000, 7, 1)]);
        let last = fx.clock.last();
        assert_eq!(last.millis(), WALL + 1_000);
        assert_eq!(last.counter(), 8);
        assert_eq!(last.replica(), ReplicaId::from_bytes([0xAA; 16]));
    }

    #[test]
    fn large_batch_of_past_messages_is_fully_applied() {
        let mut fx = Fixture::new();
        let start = WALL - 10_000_000;
        let batch: Vec<_> = (0..70_000u64)
            .map(|i| {
                ChangeMessage::new(
                    CellKey::new(DatasetId(1), RowId::from_bytes((i as u128).to_be_bytes()), ColumnId(1)),
                    Value::from(i as i64),
                    Timestamp::new(start + i, 0, ReplicaId::from_bytes([0xBB; 16])),
                )
            })
            .collect();

        let outcome = fx.apply(batch);
        assert_eq!(outcome.rejected, 0);
        assert_eq!(outcome.applied, 70_000);
        assert_eq!(fx.store.len(), 70_000);
        assert_eq!(fx.clock.last().millis(), WALL);
        assert_eq!(fx.clock.last().counter(), 0);
    }

    #[test]
    fn split_and_whole_batches_agree() {
        let batch: Vec<_> = (0..6u16).map(|c| msg(1 + c % 2, WALL - 50, c, i64::from(c))).collect();

        let mut whole = Fixture::new();
        let whole_outcome = whole.apply(batch.clone());

        let mut split = Fixture::new();
        let first = split.apply(batch[3..].to_vec());
        let second = split.apply(batch[..3].to_vec());

        assert_eq!(whole_outcome.applied, first.applied + second.applied);
        assert_eq!(whole.trie.root_hash(), split.trie.root_hash());
        assert!(whole.clock.last() > batch.iter().map(|m| m.timestamp).max().unwrap());
    }

    #[test]
    fn merge_is_logged_with_a_clock_record() {
        let mut fx = Fixture::new();
        let mut log = MessageLog::new(Box::new(InMemoryBackend::new()), false);
        fx.apply_logged(vec![msg(1, WALL, 0, 1), msg(2, WALL, 1, 2)], Some(&mut log));
        let scan = log.replay(&fx.schema).unwrap();
        assert_eq!(scan.message_count(), 2);
        assert_eq!(scan.records.last().map(|(_, r)| r.clone()), Some(LogRecord::Clock(fx.clock.last())));
        assert_eq!(latest_timestamp(fx.store.iter()).map(|t| t.counter()), Some(1));
    }
}
