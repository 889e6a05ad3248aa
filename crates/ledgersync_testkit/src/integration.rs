//! Cross-crate integration test helpers.
//!
//! [`SyncHarness`] holds a set of replicas and a relay and runs real sync
//! sessions between them over loopback transports.

use crate::fixtures::{budget_schema, replica_id, TestReplica, BASE_MILLIS};
use ledgersync_crdt::{ChangeMessage, ManualTimeSource, MerkleTrie, Replica, ReplicaId};
use ledgersync_engine::{LoopbackTransport, PeerId, Responder, SyncConfig, SyncReport, SyncResult, SyncSession};
use ledgersync_relay::{RelayConfig, RelayServer};
use std::sync::Arc;

/// A set of replicas and one relay.
pub struct SyncHarness {
    /// The replicas, with ids `replica_id(1)`, `replica_id(2)`, ...
    pub replicas: Vec<TestReplica>,
    /// The relay all replicas can sync through, on its own manual clock.
    pub relay: Arc<RelayServer>,
    /// The relay's wall clock.
    pub relay_time: Arc<ManualTimeSource>,
    config: SyncConfig,
}

impl SyncHarness {
    /// Creates `count` in-memory replicas and a relay.
    pub fn new(count: u8) -> Self {
        Self::with_config(count, SyncConfig::default())
    }

    /// Creates a harness whose sessions use `config`.
    pub fn with_config(count: u8, config: SyncConfig) -> Self {
        let relay_time = Arc::new(ManualTimeSource::new(BASE_MILLIS));
        let relay_replica = Replica::with_time_source(replica_id(0xEE), budget_schema(), relay_time.clone());
        let relay = RelayServer::new(Arc::new(relay_replica), RelayConfig::default())
            .expect("default relay config is valid");
        Self {
            replicas: (1..=count).map(TestReplica::memory).collect(),
            relay: Arc::new(relay),
            relay_time,
            config,
        }
    }

    /// Replica `index`, zero-based.
    pub fn replica(&self, index: usize) -> &TestReplica {
        &self.replicas[index]
    }

    /// Runs one session from replica `from` against replica `to`.
    pub async fn sync_pair(&self, from: usize, to: usize) -> SyncResult<SyncReport> {
        let responder = Responder::new(Arc::clone(&self.replicas[to].replica));
        let transport = LoopbackTransport::new(peer_name(self.replicas[from].id()), responder);
        let mut session = SyncSession::new(Arc::clone(&self.replicas[from].replica), self.config.clone());
        session.run(&transport, &peer_name(self.replicas[to].id())).await
    }

    /// Runs one session from replica `from` against the relay.
    pub async fn sync_with_relay(&self, from: usize) -> SyncResult<SyncReport> {
        let transport = LoopbackTransport::new(peer_name(self.replicas[from].id()), Arc::clone(&self.relay));
        let mut session = SyncSession::new(Arc::clone(&self.replicas[from].replica), self.config.clone());
        session.run(&transport, &PeerId::new("relay")).await
    }

    /// Syncs every replica with the relay twice over, so the last one's
    /// messages reach the first.
    pub async fn sync_all_via_relay(&self) -> SyncResult<()> {
        for _ in 0..2 {
            for index in 0..self.replicas.len() {
                self.sync_with_relay(index).await?;
            }
        }
        Ok(())
    }

    /// Returns true if every replica and the relay share one root hash.
    pub fn is_converged(&self) -> bool {
        let root = self.relay.replica().root_hash();
        self.replicas.iter().all(|r| r.root_hash() == root)
    }

    /// Asserts convergence, naming the first replica that differs.
    ///
    /// # Panics
    ///
    /// Panics if any replica's root hash differs from the relay's.
    pub fn assert_converged(&self) {
        let root = self.relay.replica().root_hash();
        for replica in &self.replicas {
            assert_eq!(
                replica.root_hash(),
                root,
                "replica {} has not converged with the relay",
                replica.id()
            );
        }
    }
}

/// The peer name used for a replica.
pub fn peer_name(id: ReplicaId) -> PeerId {
    PeerId::new(id.to_hex())
}

/// Applies `messages` to a fresh replica in the given order and returns its trie.
pub fn trie_after(messages: &[ChangeMessage]) -> MerkleTrie {
    let replica = TestReplica::memory(9);
    replica
        .apply_remote(messages.to_vec())
        .expect("in-memory apply does not fail");
    replica.trie_snapshot()
}
