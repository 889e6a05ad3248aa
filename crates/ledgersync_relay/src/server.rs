//! The relay server.

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use ledgersync_crdt::{CoreError, Replica, ReplicaConfig, ReplicaId, Schema, SystemTimeSource};
use ledgersync_engine::{EnvelopeHandler, PeerId, Responder, Transport, TransportError};
use ledgersync_protocol::{Envelope, EnvelopeKind};
use ledgersync_storage::FileBackend;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Per-peer request counters.
#[derive(Debug, Clone)]
pub struct PeerStats {
    /// Requests received.
    pub requests: u64,
    /// Trie requests received.
    pub trie_requests: u64,
    /// Fetch requests received.
    pub fetches: u64,
    /// Push requests received.
    pub pushes: u64,
    /// Messages the peer pushed that were new to the relay.
    pub messages_applied: u64,
    /// Requests answered with an error envelope.
    pub refused: u64,
    /// Request bytes received.
    pub bytes_in: u64,
    /// Response bytes sent.
    pub bytes_out: u64,
    /// When the last request arrived.
    pub last_seen: Instant,
}

impl PeerStats {
    fn new() -> Self {
        Self {
            requests: 0,
            trie_requests: 0,
            fetches: 0,
            pushes: 0,
            messages_applied: 0,
            refused: 0,
            bytes_in: 0,
            bytes_out: 0,
            last_seen: Instant::now(),
        }
    }
}

/// A replica that only stores and serves messages.
///
/// The relay never writes cells of its own. It answers every request from
/// its replica through a [`Responder`] that enforces the [`RelayConfig`]
/// limits, and keeps counters per peer.
///
/// # Example
///
/// ```
/// use ledgersync_crdt::{DatasetDef, Schema};
/// use ledgersync_relay::{RelayConfig, RelayServer};
/// use std::sync::Arc;
///
/// let schema = Arc::new(Schema::new(vec![DatasetDef::new(1, "accounts").column(1, "name")]).unwrap());
/// let relay = RelayServer::in_memory(schema, RelayConfig::default()).unwrap();
/// assert_eq!(relay.message_count(), 0);
/// ```
pub struct RelayServer {
    responder: Responder,
    config: RelayConfig,
    peers: RwLock<HashMap<PeerId, PeerStats>>,
}

impl RelayServer {
    /// Creates a relay over an existing replica.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidConfig`] if a limit is unusable.
    pub fn new(replica: Arc<Replica>, config: RelayConfig) -> RelayResult<Self> {
        config.validate().map_err(RelayError::InvalidConfig)?;
        Ok(Self {
            responder: Responder::with_limits(replica, config.limits()),
            config,
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// Creates a relay with an in-memory replica.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn in_memory(schema: Arc<Schema>, config: RelayConfig) -> RelayResult<Self> {
        Self::new(Arc::new(Replica::new(ReplicaId::random(), schema)), config)
    }

    /// Opens a relay whose replica persists to the log at `path`.
    ///
    /// # Errors
    ///
    /// Invalid configuration, I/O errors or log corruption.
    pub fn open(id: ReplicaId, path: &Path, schema: Arc<Schema>, config: RelayConfig) -> RelayResult<Self> {
        config.validate().map_err(RelayError::InvalidConfig)?;
        let backend = FileBackend::open(path).map_err(CoreError::from)?;
        let replica = Replica::open(
            id,
            schema,
            Box::new(backend),
            ReplicaConfig::default(),
            Arc::new(SystemTimeSource),
        )?;
        info!(path = %path.display(), messages = replica.message_count(), "relay opened");
        Self::new(Arc::new(replica), config)
    }

    /// The relay's replica.
    pub fn replica(&self) -> &Arc<Replica> {
        self.responder.replica()
    }

    /// The relay configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.replica().message_count()
    }

    /// Counters for one peer.
    pub fn peer_stats(&self, peer: &PeerId) -> Option<PeerStats> {
        self.peers.read().get(peer).cloned()
    }

    /// Every peer seen so far.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.peers.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Handles one request from `peer` and returns the encoded response.
    pub fn handle_request(&self, peer: &PeerId, request: &[u8]) -> Vec<u8> {
        let kind = Envelope::peek_header(request).ok().map(|(_, kind)| kind);
        let response = self.responder.respond(request);
        let reply = Envelope::decode(&response).ok();

        let mut peers = self.peers.write();
        let stats = peers.entry(peer.clone()).or_insert_with(PeerStats::new);
        stats.requests += 1;
        stats.bytes_in += request.len() as u64;
        stats.bytes_out += response.len() as u64;
        stats.last_seen = Instant::now();
        match kind {
            Some(EnvelopeKind::TrieRequest) => stats.trie_requests += 1,
            Some(EnvelopeKind::FetchRequest) => stats.fetches += 1,
            Some(EnvelopeKind::PushRequest) => stats.pushes += 1,
            _ => {}
        }
        match reply {
            Some(Envelope::PushResponse { applied, .. }) => {
                stats.messages_applied += u64::from(applied);
            }
            Some(Envelope::Error { code, .. }) => {
                stats.refused += 1;
                debug!(peer = %peer, %code, "request refused");
            }
            _ => {}
        }
        response
    }

    /// Moves the relay onto a tokio task and returns a handle to reach it.
    ///
    /// Requests are served one at a time in arrival order. The task ends
    /// when every handle is dropped. Must be called within a tokio runtime.
    pub fn spawn(self: Arc<Self>) -> RelayHandle {
        let (sender, mut receiver) = mpsc::channel::<RelayRequest>(self.config.queue_capacity);
        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                let response = self.handle_request(&request.from, &request.bytes);
                // The requester may have timed out and gone away.
                let _ = request.reply.send(response);
            }
            debug!("relay task stopped");
        });
        RelayHandle {
            sender,
            origin: PeerId::new("anonymous"),
        }
    }
}

impl EnvelopeHandler for RelayServer {
    fn handle_envelope(&self, peer: &PeerId, request: &[u8]) -> Vec<u8> {
        self.handle_request(peer, request)
    }
}

struct RelayRequest {
    from: PeerId,
    bytes: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

/// A cloneable connection to a spawned relay.
#[derive(Clone)]
pub struct RelayHandle {
    sender: mpsc::Sender<RelayRequest>,
    origin: PeerId,
}

impl RelayHandle {
    /// A handle whose requests are attributed to `origin`.
    #[must_use]
    pub fn as_peer(&self, origin: PeerId) -> Self {
        Self {
            sender: self.sender.clone(),
            origin,
        }
    }

    /// The peer requests are attributed to.
    pub fn origin(&self) -> &PeerId {
        &self.origin
    }

    /// Sends one request and waits for the response.
    ///
    /// # Errors
    ///
    /// [`RelayError::Stopped`] if the relay task is gone.
    pub async fn request(&self, bytes: Vec<u8>) -> RelayResult<Vec<u8>> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(RelayRequest {
                from: self.origin.clone(),
                bytes,
                reply,
            })
            .await
            .map_err(|_| RelayError::Stopped)?;
        response.await.map_err(|_| RelayError::Stopped)
    }
}

#[async_trait]
impl Transport for RelayHandle {
    async fn send_envelope(&self, _peer: &PeerId, envelope: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        self.request(envelope).await.map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_crdt::{DatasetDef, Prefix, RowId, Timestamp};
    use ledgersync_protocol::{ErrorCode, MessageBatch};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![DatasetDef::new(1, "transactions")
                .column(1, "amount")
                .column(2, "payee")])
            .unwrap(),
        )
    }

    fn relay(config: RelayConfig) -> RelayServer {
        RelayServer::in_memory(schema(), config).unwrap()
    }

    #[test]
    fn relay_lifecycle() {
        let relay = relay(RelayConfig::default());
        assert_eq!(relay.message_count(), 0);
        assert!(relay.peers().is_empty());
        assert!(matches!(
            RelayServer::in_memory(schema(), RelayConfig::new().with_max_push_batch(0)),
            Err(RelayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn push_and_fetch_are_counted_per_peer() {
        let relay = relay(RelayConfig::default());
        let writer = Replica::new(ReplicaId::random(), schema());
        let message = writer
            .write("transactions", RowId::random(), "payee", "landlord")
            .unwrap();

        let phone = PeerId::new("phone");
        let push = Envelope::PushRequest(MessageBatch::from_messages([&message]))
            .encode()
            .unwrap();
        relay.handle_request(&phone, &push);
        let fetch = Envelope::FetchRequest {
            prefixes: vec![Prefix::ROOT],
        }
        .encode()
        .unwrap();
        relay.handle_request(&phone, &fetch);

        let stats = relay.peer_stats(&phone).unwrap();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.pushes, 1);
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.messages_applied, 1);
        assert_eq!(stats.bytes_in, (push.len() + fetch.len()) as u64);
        assert_eq!(relay.message_count(), 1);
        assert!(relay.peer_stats(&PeerId::new("laptop")).is_none());
    }

    #[test]
    fn limits_are_enforced() {
        let relay = relay(RelayConfig::new().with_max_fetch_prefixes(1));
        let peer = PeerId::new("phone");
        let fetch = Envelope::FetchRequest {
            prefixes: vec![Prefix::ROOT, Prefix::ROOT],
        }
        .encode()
        .unwrap();
        let reply = Envelope::decode(&relay.handle_request(&peer, &fetch)).unwrap();
        assert!(matches!(
            reply,
            Envelope::Error {
                code: ErrorCode::LimitExceeded,
                ..
            }
        ));
        assert_eq!(relay.peer_stats(&peer).unwrap().refused, 1);
    }

    #[tokio::test]
    async fn spawned_relay_serves_handles() {
        let relay = Arc::new(relay(RelayConfig::default()));
        let handle = Arc::clone(&relay).spawn().as_peer(PeerId::new("laptop"));

        let clock = Timestamp::new(0, 0, ReplicaId::random());
        let request = Envelope::ClockRequest { clock }.encode().unwrap();
        let response = handle
            .send_envelope(&PeerId::new("relay"), request)
            .await
            .unwrap();
        assert!(matches!(
            Envelope::decode(&response).unwrap(),
            Envelope::ClockResponse { .. }
        ));
        assert_eq!(relay.peers(), vec![PeerId::new("laptop")]);
    }

    #[test]
    fn open_persists_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.lsml");
        let id = ReplicaId::random();
        let writer = Replica::new(ReplicaId::random(), schema());
        let message = writer.write("transactions", RowId::random(), "amount", 12i64).unwrap();
        {
            let relay = RelayServer::open(id, &path, schema(), RelayConfig::default()).unwrap();
            relay.replica().apply_remote(vec![message.clone()]).unwrap();
            relay.replica().flush().unwrap();
        }
        let relay = RelayServer::open(id, &path, schema(), RelayConfig::default()).unwrap();
        assert_eq!(relay.message_count(), 1);
        assert_eq!(relay.replica().messages_since(Timestamp::zero()), vec![message]);
    }
}
