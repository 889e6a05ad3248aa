//! Property-based test generators using proptest.
//!
//! Message strategies draw from small pools of replicas, rows and columns so
//! generated histories collide on cells and timestamps often enough to
//! exercise last-writer-wins.

use crate::fixtures::{replica_id, row_id, BASE_MILLIS};
use ledgersync_crdt::{CellKey, ChangeMessage, ColumnId, DatasetId, ReplicaId, RowId, Timestamp, Value};
use proptest::prelude::*;

/// Width of the generated time window: the three days before the fixture
/// base, so fixture clocks never see generated timestamps as skewed.
pub const TIME_WINDOW_MS: u64 = 3 * 24 * 60 * 60 * 1000;

/// Strategy for replica ids from a pool of four.
pub fn replica_id_strategy() -> impl Strategy<Value = ReplicaId> {
    (1u8..=4).prop_map(replica_id)
}

/// Strategy for row ids from a pool of sixteen.
pub fn row_id_strategy() -> impl Strategy<Value = RowId> {
    (0u64..16).prop_map(row_id)
}

/// Strategy for cells of the budget schema's `transactions` dataset.
pub fn cell_strategy() -> impl Strategy<Value = CellKey> {
    (row_id_strategy(), 1u16..=6).prop_map(|(row, column)| CellKey::new(DatasetId(1), row, ColumnId(column)))
}

/// Strategy for timestamps within [`TIME_WINDOW_MS`] before the fixture base.
pub fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    (0..TIME_WINDOW_MS, 0u16..4, replica_id_strategy()).prop_map(|(offset, counter, replica)| {
        Timestamp::new(BASE_MILLIS - TIME_WINDOW_MS + offset, counter, replica)
    })
}

/// Strategy for cell values, NaN excluded.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        1 => Just(Value::Null),
        3 => (-1_000_000i64..1_000_000).prop_map(Value::from),
        1 => proptest::num::f64::NORMAL.prop_map(Value::Number),
        2 => "[a-z ]{0,24}".prop_map(Value::String),
    ]
}

/// Strategy for change messages.
pub fn message_strategy() -> impl Strategy<Value = ChangeMessage> {
    (cell_strategy(), value_strategy(), timestamp_strategy())
        .prop_map(|(cell, value, timestamp)| ChangeMessage::new(cell, value, timestamp))
}

/// Strategy for message histories. Duplicate timestamps are removed so
/// every message is distinct.
pub fn message_batch_strategy(min: usize, max: usize) -> impl Strategy<Value = Vec<ChangeMessage>> {
    prop::collection::vec(message_strategy(), min..max).prop_map(|mut messages| {
        messages.sort_by_key(|m| m.timestamp);
        messages.dedup_by_key(|m| m.timestamp);
        messages
    })
}

/// Strategy for a history split between two replicas, with some overlap.
pub fn split_history_strategy(max: usize) -> impl Strategy<Value = (Vec<ChangeMessage>, Vec<ChangeMessage>)> {
    message_batch_strategy(0, max)
        .prop_flat_map(|messages| {
            let len = messages.len();
            (Just(messages), prop::collection::vec(0u8..3, len))
        })
        .prop_map(|(messages, sides)| {
            let mut left = Vec::new();
            let mut right = Vec::new();
            for (message, side) in messages.into_iter().zip(sides) {
                match side {
                    0 => left.push(message),
                    1 => right.push(message),
                    _ => {
                        left.push(message.clone());
                        right.push(message);
                    }
                }
            }
            (left, right)
        })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::budget_schema;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn messages_fit_the_budget_schema(message in message_strategy()) {
            let schema = budget_schema();
            prop_assert!(schema.has_column(message.dataset, message.column));
            let decoded = ChangeMessage::decode(&message.encode(), &schema).unwrap();
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn batches_have_unique_timestamps(batch in message_batch_strategy(0, 64)) {
            prop_assert!(batch.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        }

        #[test]
        fn split_covers_history((left, right) in split_history_strategy(32)) {
            for message in left.iter().chain(&right) {
                prop_assert!(message.timestamp.millis() < BASE_MILLIS);
            }
        }
    }

    #[test]
    fn config_presets() {
        assert_eq!(PropTestConfig::default().cases, 256);
        assert!(PropTestConfig::quick().cases < PropTestConfig::thorough().cases);
    }
}
