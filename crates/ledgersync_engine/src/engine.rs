//! Long-lived sync driver for one replica.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::session::{CancelHandle, SessionState, SyncReport, SyncSession};
use crate::transport::{PeerId, Transport};
use ledgersync_crdt::Replica;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

/// Statistics about sync sessions.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sessions that completed.
    pub cycles_completed: u64,
    /// Sessions that failed.
    pub cycles_failed: u64,
    /// Messages fetched over all sessions.
    pub messages_fetched: u64,
    /// Messages pushed over all sessions.
    pub messages_pushed: u64,
    /// Local cells changed by sync.
    pub cells_changed: u64,
    /// When the last session completed.
    pub last_sync_time: Option<Instant>,
    /// Reason and message of the last failure, cleared on success.
    pub last_error: Option<String>,
}

/// Runs sync sessions for a replica over a transport, one at a time.
pub struct SyncEngine<T: Transport> {
    replica: Arc<Replica>,
    transport: T,
    config: SyncConfig,
    state: Arc<RwLock<SessionState>>,
    stats: RwLock<SyncStats>,
    cancel: CancelHandle,
}

impl<T: Transport> SyncEngine<T> {
    /// Creates a new engine.
    pub fn new(replica: Arc<Replica>, transport: T, config: SyncConfig) -> Self {
        Self {
            replica,
            transport,
            config,
            state: Arc::new(RwLock::new(SessionState::Idle)),
            stats: RwLock::new(SyncStats::default()),
            cancel: CancelHandle::new(),
        }
    }

    /// The replica being synced.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The session configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// State of the current or last session.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Statistics so far.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Cancels the running session, if any.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that cancels whatever session is running when it fires.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs one session with `peer`.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidState`] if a session is already running, otherwise
    /// whatever ended the session.
    pub async fn sync(&self, peer: &PeerId) -> SyncResult<SyncReport> {
        {
            let mut state = self.state.write();
            if !state.can_start_sync() {
                return Err(SyncError::InvalidState {
                    state: state.name(),
                    action: "sync",
                });
            }
            *state = SessionState::ClockExchange;
        }
        self.cancel.reset();

        let mut session = SyncSession::new(Arc::clone(&self.replica), self.config.clone())
            .with_cancel_handle(self.cancel.clone())
            .with_observer(Arc::clone(&self.state));
        let result = session.run(&self.transport, peer).await;

        match &result {
            Ok(report) => {
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.messages_fetched += report.fetched as u64;
                stats.messages_pushed += report.pushed as u64;
                stats.cells_changed += report.cells_changed as u64;
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
            }
            Err(err) => self.handle_error(err),
        }
        result
    }

    fn handle_error(&self, error: &SyncError) {
        *self.state.write() = SessionState::Failed;
        let mut stats = self.stats.write();
        stats.cycles_failed += 1;
        stats.last_error = Some(format!("{}: {error}", error.reason()));
    }
}
