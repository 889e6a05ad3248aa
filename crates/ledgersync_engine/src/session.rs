//! The sync session state machine.
//!
//! A session is driven by feeding it responses: [`SyncSession::start`]
//! returns the first request, and each [`SyncSession::handle_response`]
//! returns either the next request or the finished [`SyncReport`]. The
//! transitions never block. [`SyncSession::run`] drives them over a
//! [`Transport`] with a timeout per state.
//!
//! ```text
//! Idle -> ClockExchange -> TrieNegotiation -> MessageExchange -> Applying -> Idle
//!                               ^                                   |
//!                               +------------- next pass -----------+
//! ```
//!
//! Local state is only touched in `Applying` and when the round ends, so a
//! session that fails earlier leaves the replica as it was.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{PeerId, Transport};
use ledgersync_crdt::{ChangeMessage, Divergence, Prefix, Replica, Timestamp, TrieView};
use ledgersync_protocol::{Envelope, ErrorCode, MessageBatch};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not running.
    #[default]
    Idle,
    /// Swapping clocks.
    ClockExchange,
    /// Comparing tries.
    TrieNegotiation,
    /// Fetching and pushing messages.
    MessageExchange,
    /// Merging fetched messages.
    Applying,
    /// Ended with an error.
    Failed,
}

impl SessionState {
    /// Kebab-case name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ClockExchange => "clock-exchange",
            Self::TrieNegotiation => "trie-negotiation",
            Self::MessageExchange => "message-exchange",
            Self::Applying => "applying",
            Self::Failed => "failed",
        }
    }

    /// Returns true while a session is running.
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Failed)
    }

    /// Returns true if a new session may start.
    #[must_use]
    pub fn can_start_sync(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do after a transition.
#[derive(Debug)]
pub enum Step {
    /// Send this request and feed the response back.
    Send(Envelope),
    /// The session finished.
    Done(SyncReport),
}

/// Summary of a finished session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Negotiation passes run.
    pub passes: u32,
    /// Requests sent.
    pub round_trips: u32,
    /// Divergent ranges found, over all passes.
    pub divergent_ranges: usize,
    /// Messages fetched from the peer.
    pub fetched: usize,
    /// Messages pushed to the peer.
    pub pushed: usize,
    /// Fetched messages stored locally for the first time.
    pub applied: usize,
    /// Fetched messages already present.
    pub duplicates: usize,
    /// Fetched messages the local clock or schema refused.
    pub rejected: usize,
    /// Fetched entries that did not decode.
    pub malformed: usize,
    /// Pushed messages the peer stored for the first time.
    pub remote_applied: usize,
    /// Local cells whose value changed.
    pub cells_changed: usize,
    /// The peer's clock, as received.
    pub remote_clock: Option<Timestamp>,
    /// Wall time from start to finish.
    pub duration: Duration,
}

impl SyncReport {
    /// Returns true if no message moved in either direction.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.fetched == 0 && self.pushed == 0
    }
}

/// Cancels a running session from elsewhere.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// A fresh, uncancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clears a previous request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One sync round with one peer.
pub struct SyncSession {
    replica: Arc<Replica>,
    config: SyncConfig,
    state: SessionState,
    observer: Option<Arc<RwLock<SessionState>>>,
    cancel: CancelHandle,
    started: Option<Instant>,
    staged_clock: Option<Timestamp>,
    pass: u32,
    in_flight: Vec<Prefix>,
    pending_frontier: VecDeque<Prefix>,
    divergent: Vec<Divergence>,
    pending_fetch: VecDeque<Vec<Prefix>>,
    pending_push: VecDeque<Vec<ChangeMessage>>,
    in_flight_push: usize,
    fetched: Vec<ChangeMessage>,
    report: SyncReport,
}

impl SyncSession {
    /// Creates an idle session.
    pub fn new(replica: Arc<Replica>, config: SyncConfig) -> Self {
        Self {
            replica,
            config,
            state: SessionState::Idle,
            observer: None,
            cancel: CancelHandle::new(),
            started: None,
            staged_clock: None,
            pass: 0,
            in_flight: Vec::new(),
            pending_frontier: VecDeque::new(),
            divergent: Vec::new(),
            pending_fetch: VecDeque::new(),
            pending_push: VecDeque::new(),
            in_flight_push: 0,
            fetched: Vec::new(),
            report: SyncReport::default(),
        }
    }

    /// Uses `cancel` instead of a private handle.
    #[must_use]
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Mirrors every state change into `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<RwLock<SessionState>>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// A handle that cancels this session.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Counters so far.
    pub fn report(&self) -> &SyncReport {
        &self.report
    }

    /// Begins the round and returns the clock request.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidState`] unless the session is idle or failed.
    pub fn start(&mut self) -> SyncResult<Envelope> {
        if !self.state.can_start_sync() {
            return Err(SyncError::InvalidState {
                state: self.state.name(),
                action: "start",
            });
        }
        self.reset();
        self.started = Some(Instant::now());
        self.set_state(SessionState::ClockExchange);
        Ok(self.request(Envelope::ClockRequest {
            clock: self.replica.latest_clock(),
        }))
    }

    /// Feeds the response to the last request.
    ///
    /// # Errors
    ///
    /// Any failure moves the session to [`SessionState::Failed`].
    pub fn handle_response(&mut self, response: &[u8]) -> SyncResult<Step> {
        let result = self.advance(response);
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    /// Runs the whole round over `transport`.
    ///
    /// # Errors
    ///
    /// Network failures, per-state timeouts, cancellation and anything
    /// [`handle_response`](Self::handle_response) reports.
    pub async fn run<T>(&mut self, transport: &T, peer: &PeerId) -> SyncResult<SyncReport>
    where
        T: Transport + ?Sized,
    {
        let mut request = self.start()?;
        loop {
            let response = match self.exchange(transport, peer, &request).await {
                Ok(response) => response,
                Err(err) => {
                    self.fail(&err);
                    return Err(err);
                }
            };
            match self.handle_response(&response)? {
                Step::Send(next) => request = next,
                Step::Done(report) => return Ok(report),
            }
        }
    }

    async fn exchange<T>(&self, transport: &T, peer: &PeerId, request: &Envelope) -> SyncResult<Vec<u8>>
    where
        T: Transport + ?Sized,
    {
        self.check_cancelled()?;
        let bytes = request.encode()?;
        let state = self.state;
        match tokio::time::timeout(
            self.config.timeout_for(state),
            transport.send_envelope(peer, bytes),
        )
        .await
        {
            Ok(response) => Ok(response?),
            Err(_) => Err(SyncError::Timeout { state: state.name() }),
        }
    }

    fn advance(&mut self, response: &[u8]) -> SyncResult<Step> {
        self.check_cancelled()?;
        let envelope = Envelope::decode(response)?;
        if let Envelope::Error { code, detail } = envelope {
            return Err(match code {
                ErrorCode::VersionMismatch => SyncError::VersionMismatch { message: detail },
                code => SyncError::Remote { code, detail },
            });
        }
        match (self.state, envelope) {
            (SessionState::ClockExchange, Envelope::ClockResponse { clock }) => {
                Ok(self.on_clock(clock))
            }
            (SessionState::TrieNegotiation, Envelope::TrieResponse { depth: 0, .. }) => {
                Err(SyncError::protocol("trie response covers no levels"))
            }
            (SessionState::TrieNegotiation, Envelope::TrieResponse { depth, nodes }) => {
                let view = TrieView::from_nodes(nodes);
                let frontier = std::mem::take(&mut self.in_flight);
                let step = self.replica.diff_step(&view, &frontier, depth);
                self.divergent.extend(step.divergent);
                self.pending_frontier.extend(step.frontier);
                self.negotiate()
            }
            (SessionState::MessageExchange, Envelope::MessageBatch(batch)) => {
                let decoded = batch.decode_batch(self.replica.schema());
                for (index, err) in &decoded.errors {
                    warn!(index, error = %err, "dropping malformed fetched message");
                }
                self.report.malformed += decoded.errors.len();
                self.report.fetched += decoded.messages.len();
                self.fetched.extend(decoded.messages);
                self.exchange_next()
            }
            (SessionState::MessageExchange, Envelope::PushResponse { applied, duplicates, rejected }) => {
                debug!(sent = self.in_flight_push, applied, duplicates, rejected, "push acknowledged");
                self.report.pushed += self.in_flight_push;
                self.report.remote_applied += applied as usize;
                self.in_flight_push = 0;
                self.exchange_next()
            }
            (state, envelope) => Err(SyncError::protocol(format!(
                "unexpected {} during {state}",
                envelope.kind()
            ))),
        }
    }

    fn on_clock(&mut self, clock: Timestamp) -> Step {
        self.report.remote_clock = Some(clock);
        match self.replica.check_clock(&clock) {
            Ok(()) => self.staged_clock = Some(clock),
            Err(err) => warn!(remote = %clock, error = %err, "peer clock not adopted"),
        }
        self.begin_pass()
    }

    fn begin_pass(&mut self) -> Step {
        self.pass += 1;
        self.report.passes = self.pass;
        self.divergent.clear();
        self.pending_frontier.clear();
        self.set_state(SessionState::TrieNegotiation);
        self.send_trie_request(vec![Prefix::ROOT])
    }

    fn send_trie_request(&mut self, prefixes: Vec<Prefix>) -> Step {
        self.in_flight.clone_from(&prefixes);
        Step::Send(self.request(Envelope::TrieRequest {
            depth: self.config.negotiation_depth,
            prefixes,
        }))
    }

    fn negotiate(&mut self) -> SyncResult<Step> {
        if !self.pending_frontier.is_empty() {
            let take = self.pending_frontier.len().min(self.config.max_prefixes_per_request);
            let chunk: Vec<Prefix> = self.pending_frontier.drain(..take).collect();
            return Ok(self.send_trie_request(chunk));
        }
        if self.divergent.is_empty() {
            return self.finish();
        }

        self.report.divergent_ranges += self.divergent.len();
        debug!(pass = self.pass, ranges = self.divergent.len(), "divergent ranges found");
        let pulls: Vec<Prefix> = self
            .divergent
            .iter()
            .filter(|d| d.direction.needs_pull())
            .map(|d| d.prefix)
            .collect();
        let pushes: Vec<Prefix> = self
            .divergent
            .iter()
            .filter(|d| d.direction.needs_push())
            .map(|d| d.prefix)
            .collect();
        self.pending_fetch = pulls
            .chunks(self.config.max_prefixes_per_request)
            .map(<[Prefix]>::to_vec)
            .collect();
        let outgoing = self.replica.messages_in_prefixes(&pushes);
        self.pending_push = outgoing
            .chunks(self.config.push_batch_size)
            .map(<[ChangeMessage]>::to_vec)
            .collect();
        self.set_state(SessionState::MessageExchange);
        self.exchange_next()
    }

    fn exchange_next(&mut self) -> SyncResult<Step> {
        if let Some(prefixes) = self.pending_fetch.pop_front() {
            return Ok(Step::Send(self.request(Envelope::FetchRequest { prefixes })));
        }
        if let Some(messages) = self.pending_push.pop_front() {
            self.in_flight_push = messages.len();
            let batch = MessageBatch::from_messages(&messages);
            return Ok(Step::Send(self.request(Envelope::PushRequest(batch))));
        }
        self.apply()
    }

    fn apply(&mut self) -> SyncResult<Step> {
        self.check_cancelled()?;
        self.set_state(SessionState::Applying);
        self.commit_clock()?;

        let fetched = std::mem::take(&mut self.fetched);
        for chunk in fetched.chunks(self.config.apply_chunk_size) {
            self.check_cancelled()?;
            let outcome = self.replica.apply_remote(chunk.to_vec())?;
            self.report.applied += outcome.applied;
            self.report.duplicates += outcome.duplicates;
            self.report.rejected += outcome.rejected;
            self.report.cells_changed += outcome.changes.len();
        }

        if self.pass >= self.config.max_passes {
            return Err(SyncError::OutOfSync { passes: self.pass });
        }
        Ok(self.begin_pass())
    }

    fn finish(&mut self) -> SyncResult<Step> {
        self.commit_clock()?;
        self.report.duration = self.started.map(|s| s.elapsed()).unwrap_or_default();
        self.set_state(SessionState::Idle);
        info!(
            passes = self.report.passes,
            round_trips = self.report.round_trips,
            fetched = self.report.fetched,
            pushed = self.report.pushed,
            cells_changed = self.report.cells_changed,
            "sync session complete"
        );
        Ok(Step::Done(self.report.clone()))
    }

    fn commit_clock(&mut self) -> SyncResult<()> {
        let Some(clock) = self.staged_clock.take() else {
            return Ok(());
        };
        match self.replica.merge_clock(&clock) {
            Ok(_) => Ok(()),
            Err(err) if err.is_clock() => {
                warn!(remote = %clock, error = %err, "peer clock not adopted");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn request(&mut self, envelope: Envelope) -> Envelope {
        self.report.round_trips += 1;
        envelope
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "session state");
        }
        self.state = state;
        if let Some(observer) = &self.observer {
            *observer.write() = state;
        }
    }

    fn fail(&mut self, err: &SyncError) {
        if self.state == SessionState::Failed {
            return;
        }
        warn!(state = %self.state, reason = err.reason(), error = %err, "sync session failed");
        self.set_state(SessionState::Failed);
    }

    fn reset(&mut self) {
        self.started = None;
        self.staged_clock = None;
        self.pass = 0;
        self.in_flight.clear();
        self.pending_frontier.clear();
        self.divergent.clear();
        self.pending_fetch.clear();
        self.pending_push.clear();
        self.in_flight_push = 0;
        self.fetched.clear();
        self.report = SyncReport::default();
    }
}
