//! A single-writer replica: clock, store, trie and log behind one lock.

use crate::clock::{LogicalClock, SystemTimeSource, TimeSource, Timestamp, DEFAULT_MAX_DRIFT};
use crate::error::{CoreError, CoreResult};
use crate::ids::{CellKey, ReplicaId, RowId};
use crate::log::{LogRecord, MessageLog};
use crate::merge::{ApplyOutcome, CellChange, MergeContext, MergeEngine, MergeState};
use crate::merkle::{DiffStep, MerkleTrie, NodeSummary, Prefix, TrieHash, TrieView};
use crate::message::ChangeMessage;
use crate::schema::Schema;
use crate::store::MessageStore;
use crate::value::Value;
use ledgersync_storage::StorageBackend;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Receives converged cell changes, for materializing rows elsewhere.
pub trait CellSink: Send + Sync {
    /// Called once per cell whose current value changed.
    fn on_cell_change(&self, change: &CellChange);
}

/// Replica configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// How far the clock may run ahead of the wall clock.
    pub max_drift: Duration,
    /// Flush the log after every record.
    pub sync_on_write: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_drift: DEFAULT_MAX_DRIFT,
            sync_on_write: false,
        }
    }
}

impl ReplicaConfig {
    /// Sets the drift bound.
    #[must_use]
    pub fn with_max_drift(mut self, max_drift: Duration) -> Self {
        self.max_drift = max_drift;
        self
    }

    /// Sets whether every log record is flushed.
    #[must_use]
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }
}

/// Point-in-time counters of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaStats {
    /// Stored messages.
    pub messages: usize,
    /// Cells ever written.
    pub cells: usize,
    /// Allocated trie nodes.
    pub trie_nodes: usize,
    /// Root hash of the trie.
    pub root_hash: TrieHash,
    /// Current clock.
    pub clock: Timestamp,
}

struct ReplicaState {
    clock: LogicalClock,
    store: MessageStore,
    trie: MerkleTrie,
    log: Option<MessageLog>,
    merge: MergeEngine,
}

/// One replica of the budget store.
///
/// All mutation goes through a single mutex. Sink callbacks run after the
/// lock is released, so a sink may read from the replica.
pub struct Replica {
    id: ReplicaId,
    schema: Arc<Schema>,
    config: ReplicaConfig,
    time: Arc<dyn TimeSource>,
    state: Mutex<ReplicaState>,
    sink: RwLock<Option<Arc<dyn CellSink>>>,
}

impl Replica {
    /// An in-memory replica reading the system clock.
    pub fn new(id: ReplicaId, schema: Arc<Schema>) -> Self {
        Self::with_time_source(id, schema, Arc::new(SystemTimeSource))
    }

    /// An in-memory replica reading `time`.
    pub fn with_time_source(id: ReplicaId, schema: Arc<Schema>, time: Arc<dyn TimeSource>) -> Self {
        let config = ReplicaConfig::default();
        let clock = LogicalClock::new(id).with_max_drift(config.max_drift);
        Self::from_parts(id, schema, config, time, clock, MessageStore::new(), None)
    }

    /// Opens a replica over a message log, replaying what it holds.
    ///
    /// The clock resumes from the greatest timestamp found in the log,
    /// re-stamped with `id`, so timestamps issued after a restart stay above
    /// everything issued or merged before it.
    ///
    /// # Errors
    ///
    /// Fails on log corruption or I/O errors.
    pub fn open(
        id: ReplicaId,
        schema: Arc<Schema>,
        backend: Box<dyn StorageBackend>,
        config: ReplicaConfig,
        time: Arc<dyn TimeSource>,
    ) -> CoreResult<Self> {
        let mut log = MessageLog::new(backend, config.sync_on_write);
        let scan = log.replay(&schema)?;

        let mut store = MessageStore::new();
        let mut latest = Timestamp::new(0, 0, id);
        for (_, record) in scan.records {
            latest = latest.max(record.timestamp());
            if let LogRecord::Message(message) = record {
                store.append(message);
            }
        }
        let clock = LogicalClock::restore(Timestamp::new(latest.millis(), latest.counter(), id))
            .with_max_drift(config.max_drift);

        info!(
            replica = %id,
            messages = store.len(),
            clock = %clock.last(),
            "opened replica"
        );
        Ok(Self::from_parts(id, schema, config, time, clock, store, Some(log)))
    }

    fn from_parts(
        id: ReplicaId,
        schema: Arc<Schema>,
        config: ReplicaConfig,
        time: Arc<dyn TimeSource>,
        clock: LogicalClock,
        store: MessageStore,
        log: Option<MessageLog>,
    ) -> Self {
        let trie = MerkleTrie::from_messages(store.iter());
        Self {
            id,
            schema,
            config,
            time,
            state: Mutex::new(ReplicaState {
                clock,
                store,
                trie,
                log,
                merge: MergeEngine::new(),
            }),
            sink: RwLock::new(None),
        }
    }

    /// Replica id.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Shared schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Configuration.
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Current wall-clock reading.
    pub fn now_millis(&self) -> u64 {
        self.time.now_millis()
    }

    /// Installs the storage collaborator.
    pub fn set_sink(&self, sink: Arc<dyn CellSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Removes the storage collaborator.
    pub fn clear_sink(&self) {
        *self.sink.write() = None;
    }

    fn notify(&self, changes: &[CellChange]) {
        if changes.is_empty() {
            return;
        }
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            for change in changes {
                sink.on_cell_change(change);
            }
        }
    }

    /// Writes one cell and returns the stamped message.
    ///
    /// # Errors
    ///
    /// Unknown names, NaN, clock errors or log failures. Nothing is stored
    /// on error.
    pub fn write(
        &self,
        dataset: &str,
        row: RowId,
        column: &str,
        value: impl Into<Value>,
    ) -> CoreResult<ChangeMessage> {
        let mut messages = self.write_row(dataset, row, [(column, value.into())])?;
        messages
            .pop()
            .ok_or_else(|| CoreError::invalid_value("empty write"))
    }

    /// Writes several cells of one row, one message per cell.
    ///
    /// Every column is resolved before anything is stamped, so an unknown
    /// column leaves the replica untouched.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn write_row<'c>(
        &self,
        dataset: &str,
        row: RowId,
        values: impl IntoIterator<Item = (&'c str, Value)>,
    ) -> CoreResult<Vec<ChangeMessage>> {
        let dataset_id = self.schema.resolve_dataset(dataset)?;
        let mut cells = Vec::new();
        for (column, value) in values {
            let (_, column_id) = self.schema.resolve(dataset, column)?;
            if value.as_number().is_some_and(f64::is_nan) {
                return Err(CoreError::invalid_value(format!("NaN in column {column}")));
            }
            cells.push((CellKey::new(dataset_id, row, column_id), value));
        }

        let wall = self.time.now_millis();
        let mut written = Vec::with_capacity(cells.len());
        let mut changes = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for (cell, value) in cells {
                let timestamp = state.clock.now(wall)?;
                let old = state.store.current_value(&cell).cloned();
                let message = ChangeMessage::new(cell, value, timestamp).with_old(old.clone());
                if let Some(log) = state.log.as_mut() {
                    log.append_message(&message)?;
                }
                state.trie.insert(&message);
                state.store.append(message.clone());
                if old.as_ref() != Some(&message.value) {
                    if let Some(change) = self.cell_change(cell, &message.value) {
                        changes.push(change);
                    }
                }
                written.push(message);
            }
        }
        debug!(dataset, row = %row, cells = written.len(), "local write");
        self.notify(&changes);
        Ok(written)
    }

    fn cell_change(&self, cell: CellKey, value: &Value) -> Option<CellChange> {
        Some(CellChange {
            cell,
            dataset: Arc::clone(self.schema.dataset_name(cell.dataset)?),
            column: Arc::clone(self.schema.column_name(cell.dataset, cell.column)?),
            value: value.clone(),
        })
    }

    /// Merges messages received from a peer.
    ///
    /// # Errors
    ///
    /// Log failures; per-message problems are counted in the outcome.
    pub fn apply_remote(&self, messages: Vec<ChangeMessage>) -> CoreResult<ApplyOutcome> {
        if messages.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        let wall = self.time.now_millis();
        let outcome = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let ctx = MergeContext {
                store: &mut state.store,
                trie: &mut state.trie,
                clock: &mut state.clock,
                log: state.log.as_mut(),
            };
            state.merge.apply(ctx, messages, wall, &self.schema)?
        };
        self.notify(&outcome.changes);
        Ok(outcome)
    }

    /// Current value of a cell by names; `None` if never written.
    ///
    /// # Errors
    ///
    /// Unknown dataset or column.
    pub fn current_value(&self, dataset: &str, row: RowId, column: &str) -> CoreResult<Option<Value>> {
        let (dataset_id, column_id) = self.schema.resolve(dataset, column)?;
        Ok(self.value(&CellKey::new(dataset_id, row, column_id)))
    }

    /// Current value of a cell by ids.
    pub fn value(&self, cell: &CellKey) -> Option<Value> {
        self.state.lock().store.current_value(cell).cloned()
    }

    /// Current values of every written column of a row, by column name.
    ///
    /// # Errors
    ///
    /// Unknown dataset.
    pub fn row(&self, dataset: &str, row: RowId) -> CoreResult<Vec<(Arc<str>, Value)>> {
        let dataset_id = self.schema.resolve_dataset(dataset)?;
        let state = self.state.lock();
        Ok(state
            .store
            .row(dataset_id, row)
            .into_iter()
            .filter_map(|(column, value)| {
                let name = self.schema.column_name(dataset_id, column)?;
                Some((Arc::clone(name), value.clone()))
            })
            .collect())
    }

    /// Root hash of the trie.
    pub fn root_hash(&self) -> TrieHash {
        self.state.lock().trie.root_hash()
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.state.lock().store.len()
    }

    /// Trie nodes within `depth` levels below `prefix`.
    pub fn trie_nodes(&self, prefix: &Prefix, depth: u8) -> Vec<NodeSummary> {
        self.state.lock().trie.nodes_within(prefix, depth)
    }

    /// Compares the local trie against a window of a remote one.
    pub fn diff_step(&self, remote: &TrieView, frontier: &[Prefix], window: u8) -> DiffStep {
        self.state.lock().trie.diff_step(remote, frontier, window)
    }

    /// A copy of the trie.
    pub fn trie_snapshot(&self) -> MerkleTrie {
        self.state.lock().trie.clone()
    }

    /// Messages under any of `prefixes`, each once, in timestamp order.
    pub fn messages_in_prefixes(&self, prefixes: &[Prefix]) -> Vec<ChangeMessage> {
        let state = self.state.lock();
        let mut found = BTreeMap::new();
        for prefix in prefixes {
            for message in state.store.messages_in_prefix(prefix) {
                found
                    .entry((message.timestamp, message.cell()))
                    .or_insert_with(|| message.clone());
            }
        }
        found.into_values().collect()
    }

    /// Messages newer than `since`, in timestamp order.
    pub fn messages_since(&self, since: Timestamp) -> Vec<ChangeMessage> {
        self.state.lock().store.messages_since(since).cloned().collect()
    }

    /// The clock's last timestamp.
    pub fn latest_clock(&self) -> Timestamp {
        self.state.lock().clock.last()
    }

    /// Checks a peer clock against the drift bound without adopting it.
    ///
    /// # Errors
    ///
    /// [`ClockError::ClockSkew`](crate::ClockError::ClockSkew) if it is too
    /// far ahead.
    pub fn check_clock(&self, remote: &Timestamp) -> CoreResult<()> {
        let wall = self.time.now_millis();
        self.state.lock().clock.check_skew(remote, wall)?;
        Ok(())
    }

    /// Advances the clock past a peer clock and logs the new value.
    ///
    /// # Errors
    ///
    /// Clock errors leave the clock unchanged; log failures propagate.
    pub fn merge_clock(&self, remote: &Timestamp) -> CoreResult<Timestamp> {
        let wall = self.time.now_millis();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let merged = state.clock.merge(remote, wall)?;
        if let Some(log) = state.log.as_mut() {
            log.append_clock(merged)?;
        }
        Ok(merged)
    }

    /// Rebuilds the trie from the store and checks it against the live one.
    pub fn verify_trie(&self) -> bool {
        let state = self.state.lock();
        let rebuilt = MerkleTrie::from_messages(state.store.iter());
        rebuilt.root_hash() == state.trie.root_hash() && rebuilt.len() == state.trie.len()
    }

    /// Current merge state.
    pub fn merge_state(&self) -> MergeState {
        self.state.lock().merge.state()
    }

    /// Counters for diagnostics.
    pub fn stats(&self) -> ReplicaStats {
        let state = self.state.lock();
        ReplicaStats {
            messages: state.store.len(),
            cells: state.store.cell_count(),
            trie_nodes: state.trie.node_count(),
            root_hash: state.trie.root_hash(),
            clock: state.clock.last(),
        }
    }

    /// Flushes the log, if any.
    ///
    /// # Errors
    ///
    /// I/O errors.
    pub fn flush(&self) -> CoreResult<()> {
        if let Some(log) = self.state.lock().log.as_mut() {
            log.flush()?;
        }
        Ok(())
    }

    /// Forces the log to stable storage, if any.
    ///
    /// # Errors
    ///
    /// I/O errors.
    pub fn sync(&self) -> CoreResult<()> {
        if let Some(log) = self.state.lock().log.as_mut() {
            log.sync()?;
        }
        Ok(())
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use crate::schema::DatasetDef;
    use ledgersync_storage::{InMemoryBackend, StorageBackend};

    const T0: u64 = 1_700_000_000_000;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<CellChange>>);

    impl CellSink for Recorder {
        fn on_cell_change(&self, change: &CellChange) {
            self.0.lock().push(change.clone());
        }
    }

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                DatasetDef::new(1, "transactions")
                    .column(1, "amount")
                    .column(2, "payee"),
                DatasetDef::new(2, "accounts").column(1, "name"),
            ])
            .unwrap(),
        )
    }

    fn replica(n: u8, time: &Arc<ManualTimeSource>) -> Replica {
        Replica::with_time_source(ReplicaId::from_bytes([n; 16]), schema(), time.clone())
    }

    #[test]
    fn write_then_read() {
        let time = Arc::new(ManualTimeSource::new(T0));
        let r = replica(1, &time);
        let row = RowId::from_bytes([5; 16]);
        let m = r.write("transactions", row, "amount", 500).unwrap();
        assert_eq!(m.old, None);
        assert_eq!(m.timestamp.millis(), T0);
        assert_eq!(
            r.current_value("transactions", row, "amount").unwrap(),
            Some(Value::from(500))
        );
        assert_eq!(r.current_value("transactions", row, "payee").unwrap(), None);

        let m2 = r.write("transactions", row, "amount", 600).unwrap();
        assert_eq!(m2.old, Some(Value::from(500)));
        assert!(m2.timestamp > m.timestamp);
        assert_eq!(r.message_count(), 2);
        assert!(r.verify_trie());
    }

    #[test]
    fn write_row_is_all_or_nothing() {
        let time = Arc::new(ManualTimeSource::new(T0));
        let r = replica(1, &time);
        let row = RowId::from_bytes([5; 16]);
        let err = r
            .write_row(
                "transactions",
                row,
                [("amount", Value::from(1)), ("memo", Value::from("x"))],
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Schema(_)));
        assert_eq!(r.message_count(), 0);

        r.write_row(
            "transactions",
            row,
            [("amount", Value::from(1)), ("payee", Value::from("grocer"))],
        )
        .unwrap();
        let values = r.row("transactions", row).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(&*values[1].0, "payee");
    }

    #[test]
    fn nan_is_refused() {
        let time = Arc::new(ManualTimeSource::new(T0));
        let r = replica(1, &time);
        let err = r
            .write("transactions", RowId::MIN, "amount", f64::NAN)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidValue { .. }));
    }

    #[test]
    fn sink_sees_local_and_remote_changes() {
        let time = Arc::new(ManualTimeSource::new(T0));
        let a = replica(1, &time);
        let b = replica(2, &time);
        let recorder = Arc::new(Recorder::default());
        b.set_sink(recorder.clone());

        let row = RowId::from_bytes([5; 16]);
        let m = a.write("transactions", row, "amount", 500).unwrap();
        let outcome = b.apply_remote(vec![m.clone()]).unwrap();
        assert_eq!(outcome.applied, 1);
        b.write("accounts", row, "name", "checking").unwrap();

        let seen = recorder.0.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(&*seen[0].dataset, "transactions");
        assert_eq!(seen[1].value, Value::from("checking"));

        assert!(b.apply_remote(vec![m]).unwrap().changes.is_empty());
        assert_eq!(recorder.0.lock().len(), 2);
        assert_eq!(a.root_hash(), a.trie_snapshot().root_hash());
    }

    #[test]
    fn reopen_restores_state_and_clock() {
        let time = Arc::new(ManualTimeSource::new(T0));
        let backend = InMemoryBackend::new();
        let id = ReplicaId::from_bytes([1; 16]);
        let row = RowId::from_bytes([5; 16]);
        let (root, last) = {
            let r = Replica::open(
                id,
                schema(),
                Box::new(backend.clone()),
                ReplicaConfig::default(),
                time.clone(),
            )
            .unwrap();
            r.write("transactions", row, "amount", 1).unwrap();
            r.write("transactions", row, "amount", 2).unwrap();
            let remote = Timestamp::new(T0 + 1_000, 9, ReplicaId::from_bytes([2; 16]));
            r.merge_clock(&remote).unwrap();
            (r.root_hash(), r.latest_clock())
        };

        time.set(T0 - 60_000);
        let r = Replica::open(
            id,
            schema(),
            Box::new(backend),
            ReplicaConfig::default(),
            time.clone(),
        )
        .unwrap();
        assert_eq!(r.root_hash(), root);
        assert_eq!(r.message_count(), 2);
        assert_eq!(
            r.current_value("transactions", row, "amount").unwrap(),
            Some(Value::from(2))
        );
        assert_eq!(r.latest_clock().millis(), last.millis());
        assert_eq!(r.latest_clock().replica(), id);
        let next = r.write("transactions", row, "payee", "x").unwrap();
        assert!(next.timestamp > last);
    }

    #[test]
    fn reopen_after_torn_write_keeps_complete_records() {
        let time = Arc::new(ManualTimeSource::new(T0));
        let backend = InMemoryBackend::new();
        let id = ReplicaId::from_bytes([1; 16]);
        {
            let r = Replica::open(id, schema(), Box::new(backend.clone()), ReplicaConfig::default(), time.clone())
                .unwrap();
            r.write("transactions", RowId::MIN, "amount", 1).unwrap();
            r.write("transactions", RowId::MIN, "payee", "x").unwrap();
        }
        let len = backend.snapshot().len() as u64;
        backend.clone().truncate(len - 3).unwrap();

        let r = Replica::open(id, schema(), Box::new(backend), ReplicaConfig::default(), time).unwrap();
        assert_eq!(r.message_count(), 1);
        assert!(r.verify_trie());
    }

    #[test]
    fn skewed_clock_is_checked_not_adopted() {
        let time = Arc::new(ManualTimeSource::new(T0));
        let r = replica(1, &time);
        let ahead = Timestamp::new(T0 + 10 * 60 * 1000, 0, ReplicaId::from_bytes([2; 16]));
        assert!(r.check_clock(&ahead).is_err());
        assert!(r.merge_clock(&ahead).is_err());
        assert!(r.latest_clock().millis() < ahead.millis());
        let near = Timestamp::new(T0 + 1_000, 0, ReplicaId::from_bytes([2; 16]));
        assert!(r.check_clock(&near).is_ok());
    }

    #[test]
    fn prefix_queries_deduplicate() {
        let time = Arc::new(ManualTimeSource::new(T0));
        let r = replica(1, &time);
        r.write("transactions", RowId::MIN, "amount", 1).unwrap();
        time.advance(120_000);
        r.write("transactions", RowId::MIN, "amount", 2).unwrap();

        let leaf = Prefix::for_millis(T0);
        let both = r.messages_in_prefixes(&[Prefix::ROOT, leaf]);
        assert_eq!(both.len(), 2);
        assert_eq!(r.messages_in_prefixes(&[leaf]).len(), 1);
        assert_eq!(r.messages_since(both[0].timestamp).len(), 1);
        assert_eq!(r.stats().messages, 2);
        assert_eq!(r.merge_state(), MergeState::Idle);
    }

    #[test]
    fn initial_sync_sized_history_applies_in_one_call() {
        let time = Arc::new(ManualTimeSource::new(T0));
        let local = replica(1, &time);
        let peer = ReplicaId::from_bytes([2; 16]);
        let history: Vec<_> = (0..70_000u64)
            .map(|i| {
                ChangeMessage::new(
                    CellKey::new(
                        crate::ids::DatasetId(1),
                        RowId::from_bytes((i as u128).to_be_bytes()),
                        crate::ids::ColumnId(1),
                    ),
                    Value::from(i as i64),
                    Timestamp::new(T0 - 10_000_000 + i, 0, peer),
                )
            })
            .collect();

        let outcome = local.apply_remote(history).unwrap();
        assert_eq!(outcome.rejected, 0);
        assert_eq!(outcome.applied, 70_000);
        assert_eq!(local.message_count(), 70_000);

        let m = local
            .write("transactions", RowId::from_bytes([0xFF; 16]), "payee", "Grocer")
            .unwrap();
        assert_eq!(m.timestamp, local.latest_clock());
        assert_eq!(m.timestamp.millis(), T0);
    }
}
