//! Convergence properties of the merge engine.

use ledgersync_crdt::{CellKey, ChangeMessage, ColumnId, DatasetId, Timestamp, Value};
use ledgersync_testkit::prelude::*;
use proptest::prelude::*;

fn apply_all(replica: &TestReplica, messages: &[ChangeMessage]) {
    replica.apply_remote(messages.to_vec()).unwrap();
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn merge_is_commutative(batch in message_batch_strategy(0, 64)) {
        let forward = TestReplica::memory(1);
        let backward = TestReplica::memory(1);
        apply_all(&forward, &batch);
        let reversed: Vec<_> = batch.iter().rev().cloned().collect();
        for message in reversed {
            backward.apply_remote(vec![message]).unwrap();
        }

        prop_assert_eq!(forward.root_hash(), backward.root_hash());
        for message in &batch {
            prop_assert_eq!(forward.value(&message.cell()), backward.value(&message.cell()));
        }
    }

    #[test]
    fn shuffled_batch_emits_the_same_changes(
        (batch, shuffled) in message_batch_strategy(0, 64)
            .prop_flat_map(|batch| (Just(batch.clone()), Just(batch).prop_shuffle()))
    ) {
        let sorted = TestReplica::memory(1);
        let permuted = TestReplica::memory(1);
        let sorted_sink = RecordingSink::new();
        let permuted_sink = RecordingSink::new();
        sorted.set_sink(sorted_sink.clone());
        permuted.set_sink(permuted_sink.clone());

        let a = sorted.apply_remote(batch).unwrap();
        let b = permuted.apply_remote(shuffled).unwrap();
        prop_assert_eq!(a.applied, b.applied);
        prop_assert_eq!(a.duplicates, b.duplicates);
        prop_assert_eq!(a.rejected, b.rejected);
        prop_assert_eq!(&a.changes, &b.changes);
        prop_assert_eq!(sorted_sink.changes(), permuted_sink.changes());
        prop_assert_eq!(sorted.latest_clock(), permuted.latest_clock());
    }

    #[test]
    fn merge_is_idempotent(batch in message_batch_strategy(1, 64)) {
        let replica = TestReplica::memory(1);
        let sink = RecordingSink::new();
        replica.set_sink(sink.clone());
        apply_all(&replica, &batch);
        let root = replica.root_hash();
        sink.take();

        let again = replica.apply_remote(batch.clone()).unwrap();
        prop_assert_eq!(again.applied, 0);
        prop_assert_eq!(again.duplicates, batch.len());
        prop_assert!(again.changes.is_empty());
        prop_assert!(sink.is_empty());
        prop_assert_eq!(replica.root_hash(), root);
    }

    #[test]
    fn union_converges((left, right) in split_history_strategy(48)) {
        let a = TestReplica::memory(1);
        let b = TestReplica::memory(2);
        apply_all(&a, &left);
        apply_all(&b, &right);

        apply_all(&a, &right);
        apply_all(&b, &left);
        prop_assert_eq!(a.root_hash(), b.root_hash());
        prop_assert_eq!(a.message_count(), b.message_count());
        for message in left.iter().chain(&right) {
            prop_assert_eq!(a.value(&message.cell()), b.value(&message.cell()));
        }
    }

    #[test]
    fn latest_timestamp_wins(batch in message_batch_strategy(1, 64)) {
        let replica = TestReplica::memory(1);
        apply_all(&replica, &batch);
        for message in &batch {
            let winner = batch
                .iter()
                .filter(|m| m.cell() == message.cell())
                .max_by_key(|m| m.timestamp)
                .unwrap();
            prop_assert_eq!(replica.value(&message.cell()), Some(winner.value.clone()));
        }
    }

    #[test]
    fn trie_ignores_arrival_order(batch in message_batch_strategy(0, 64)) {
        let mut shuffled = batch.clone();
        shuffled.reverse();
        prop_assert_eq!(trie_after(&batch).root_hash(), trie_after(&shuffled).root_hash());
    }
}

#[test]
fn later_write_wins_in_either_order() {
    let cell = CellKey::new(DatasetId(1), row_id(1), ColumnId(1));
    let early = ChangeMessage::new(cell, Value::from(100i64), Timestamp::new(BASE_MILLIS + 100, 0, replica_id(1)));
    let late = ChangeMessage::new(cell, Value::from(200i64), Timestamp::new(BASE_MILLIS + 200, 0, replica_id(2)));

    for order in [vec![early.clone(), late.clone()], vec![late.clone(), early.clone()]] {
        let replica = TestReplica::memory(3);
        for message in order {
            replica.apply_remote(vec![message]).unwrap();
        }
        assert_eq!(replica.value(&cell), Some(Value::from(200i64)));
    }
}
