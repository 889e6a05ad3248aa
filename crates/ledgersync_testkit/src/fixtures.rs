//! Test fixtures and replica helpers.
//!
//! Provides a budget schema, replicas on a manual clock, and a sink that
//! records converged cell changes.

use ledgersync_crdt::{
    CellChange, CellSink, DatasetDef, ManualTimeSource, Replica, ReplicaConfig, ReplicaId, RowId, Schema,
};
use ledgersync_storage::FileBackend;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Wall clock every fixture starts at: 2023-11-14T22:13:20Z.
pub const BASE_MILLIS: u64 = 1_700_000_000_000;

/// The budget schema used across tests.
///
/// | id | dataset | columns |
/// |---|---|---|
/// | 1 | transactions | amount, payee, category, date, notes, cleared |
/// | 2 | accounts | name, offbudget, closed |
/// | 3 | categories | name, group, is_income |
/// | 4 | payees | name |
pub fn budget_schema() -> Arc<Schema> {
    let schema = Schema::new(vec![
        DatasetDef::new(1, "transactions")
            .column(1, "amount")
            .column(2, "payee")
            .column(3, "category")
            .column(4, "date")
            .column(5, "notes")
            .column(6, "cleared"),
        DatasetDef::new(2, "accounts")
            .column(1, "name")
            .column(2, "offbudget")
            .column(3, "closed"),
        DatasetDef::new(3, "categories")
            .column(1, "name")
            .column(2, "group")
            .column(3, "is_income"),
        DatasetDef::new(4, "payees").column(1, "name"),
    ])
    .expect("budget schema is valid");
    Arc::new(schema)
}

/// The budget schema as JSON, the form the CLI loads.
pub fn budget_schema_json() -> String {
    budget_schema().to_json().expect("budget schema serializes")
}

/// A replica id with every byte set to `n`.
pub fn replica_id(n: u8) -> ReplicaId {
    ReplicaId::from_bytes([n; 16])
}

/// A deterministic row id.
pub fn row_id(n: u64) -> RowId {
    let mut bytes = [0u8; 16];
    bytes[8..].copy_from_slice(&n.to_be_bytes());
    RowId::from_bytes(bytes)
}

/// A replica on a manual clock, optionally backed by a log file.
pub struct TestReplica {
    /// The replica.
    pub replica: Arc<Replica>,
    /// Its wall clock.
    pub time: Arc<ManualTimeSource>,
    id: ReplicaId,
    temp_dir: Option<TempDir>,
}

impl TestReplica {
    /// An in-memory replica with id `replica_id(n)` at [`BASE_MILLIS`].
    pub fn memory(n: u8) -> Self {
        let time = Arc::new(ManualTimeSource::new(BASE_MILLIS));
        let id = replica_id(n);
        let replica = Replica::with_time_source(id, budget_schema(), time.clone());
        Self {
            replica: Arc::new(replica),
            time,
            id,
            temp_dir: None,
        }
    }

    /// A replica logging to a file in a fresh temporary directory.
    pub fn file(n: u8) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let time = Arc::new(ManualTimeSource::new(BASE_MILLIS));
        let id = replica_id(n);
        let replica = open_file_replica(id, &temp_dir.path().join("messages.lsml"), time.clone());
        Self {
            replica: Arc::new(replica),
            time,
            id,
            temp_dir: Some(temp_dir),
        }
    }

    /// Path of the log file, if file-backed.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("messages.lsml"))
    }

    /// Simulates a restart: drops the replica and replays its log.
    ///
    /// # Panics
    ///
    /// Panics for in-memory replicas.
    pub fn reopen(&mut self) {
        let path = self.log_path().expect("only file replicas can be reopened");
        self.replica.sync().expect("Failed to sync log");
        self.replica = Arc::new(open_file_replica(self.id, &path, self.time.clone()));
    }

    /// Moves the wall clock forward.
    pub fn advance(&self, delta_ms: u64) {
        self.time.advance(delta_ms);
    }

    /// Sets the wall clock.
    pub fn set_time(&self, millis: u64) {
        self.time.set(millis);
    }
}

impl std::ops::Deref for TestReplica {
    type Target = Replica;

    fn deref(&self) -> &Self::Target {
        &self.replica
    }
}

fn open_file_replica(id: ReplicaId, path: &Path, time: Arc<ManualTimeSource>) -> Replica {
    let backend = FileBackend::open(path).expect("Failed to open log backend");
    Replica::open(id, budget_schema(), Box::new(backend), ReplicaConfig::default(), time)
        .expect("Failed to open replica")
}

/// Runs a test with a temporary in-memory replica.
pub fn with_temp_replica<F, R>(f: F) -> R
where
    F: FnOnce(&TestReplica) -> R,
{
    let replica = TestReplica::memory(1);
    f(&replica)
}

/// Records every cell change a replica reports.
#[derive(Debug, Default)]
pub struct RecordingSink {
    changes: Mutex<Vec<CellChange>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Changes recorded so far.
    pub fn changes(&self) -> Vec<CellChange> {
        self.changes.lock().clone()
    }

    /// Removes and returns the recorded changes.
    pub fn take(&self) -> Vec<CellChange> {
        std::mem::take(&mut *self.changes.lock())
    }

    /// Number of recorded changes.
    pub fn len(&self) -> usize {
        self.changes.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.changes.lock().is_empty()
    }
}

impl CellSink for RecordingSink {
    fn on_cell_change(&self, change: &CellChange) {
        self.changes.lock().push(change.clone());
    }
}
