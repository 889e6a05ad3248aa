//! Transport seam for sync sessions.

use async_trait::async_trait;
use ledgersync_protocol::Envelope;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Identifies a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    /// Creates a peer id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failures delivering an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport is disconnected.
    #[error("not connected")]
    NotConnected,

    /// The peer is not reachable through this transport.
    #[error("peer {0} unreachable")]
    Unreachable(PeerId),

    /// The other end went away.
    #[error("connection closed")]
    Closed,

    /// Any other delivery failure.
    #[error("{message}")]
    Failed {
        /// Error message.
        message: String,
        /// Whether a retry may succeed.
        retryable: bool,
    },
}

impl TransportError {
    /// Returns true if a retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotConnected | Self::Closed => true,
            Self::Unreachable(_) => false,
            Self::Failed { retryable, .. } => *retryable,
        }
    }
}

/// Delivers an encoded request envelope to a peer and returns its encoded
/// response.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (sockets, in-process relays, mocks for testing).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request and waits for the response.
    async fn send_envelope(&self, peer: &PeerId, envelope: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send_envelope(&self, peer: &PeerId, envelope: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        (**self).send_envelope(peer, envelope).await
    }
}

/// Answers encoded request envelopes synchronously.
pub trait EnvelopeHandler: Send + Sync {
    /// Handles one request from `peer` and returns the encoded response.
    fn handle_envelope(&self, peer: &PeerId, request: &[u8]) -> Vec<u8>;
}

impl<H: EnvelopeHandler + ?Sized> EnvelopeHandler for Arc<H> {
    fn handle_envelope(&self, peer: &PeerId, request: &[u8]) -> Vec<u8> {
        (**self).handle_envelope(peer, request)
    }
}

/// Routes every request straight to a local handler.
///
/// Requests are attributed to `local`, the id of the sending side.
pub struct LoopbackTransport<H> {
    local: PeerId,
    handler: H,
    connected: AtomicBool,
    latency: Option<Duration>,
    requests: AtomicU64,
    bytes_sent: AtomicU64,
}

impl<H: EnvelopeHandler> LoopbackTransport<H> {
    /// Creates a loopback transport sending as `local`.
    pub fn new(local: PeerId, handler: H) -> Self {
        Self {
            local,
            handler,
            connected: AtomicBool::new(true),
            latency: None,
            requests: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// Delays every response.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of requests delivered.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Request bytes delivered.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    /// The handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[async_trait]
impl<H: EnvelopeHandler> Transport for LoopbackTransport<H> {
    async fn send_envelope(&self, _peer: &PeerId, envelope: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.bytes_sent.fetch_add(envelope.len() as u64, Ordering::SeqCst);
        Ok(self.handler.handle_envelope(&self.local, &envelope))
    }
}

/// A mock transport for testing: answers from a queue and records requests.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    responses: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
    requests: Mutex<Vec<Vec<u8>>>,
}

impl MockTransport {
    /// Creates a connected mock with no queued responses.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues raw response bytes.
    pub fn push_response(&self, response: Vec<u8>) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues an encoded envelope.
    pub fn push_envelope(&self, envelope: &Envelope) {
        if let Ok(bytes) = envelope.encode() {
            self.push_response(bytes);
        }
    }

    /// Queues a failure.
    pub fn push_error(&self, error: TransportError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Every request sent so far.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_envelope(&self, _peer: &PeerId, envelope: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.requests.lock().push(envelope);
        self.responses.lock().pop_front().unwrap_or(Err(TransportError::Closed))
    }
}
