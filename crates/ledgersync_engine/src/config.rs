//! Configuration for sync sessions.

use crate::session::SessionState;
use std::time::Duration;

/// Configuration for sync sessions.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Trie levels requested below each prefix per negotiation round trip.
    pub negotiation_depth: u8,
    /// Maximum messages per push request.
    pub push_batch_size: usize,
    /// Maximum fetched messages merged per chunk while applying.
    pub apply_chunk_size: usize,
    /// Negotiate, exchange and apply at most this many times per session.
    pub max_passes: u32,
    /// Maximum prefixes per trie or fetch request.
    pub max_prefixes_per_request: usize,
    /// Timeout for the clock exchange.
    pub clock_timeout: Duration,
    /// Timeout for each trie negotiation round trip.
    pub negotiation_timeout: Duration,
    /// Timeout for each fetch or push round trip.
    pub exchange_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            negotiation_depth: 4,
            push_batch_size: 500,
            apply_chunk_size: 1000,
            max_passes: 10,
            max_prefixes_per_request: 64,
            clock_timeout: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(30),
            exchange_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the negotiation depth. Clamped to at least one level.
    #[must_use]
    pub fn with_negotiation_depth(mut self, depth: u8) -> Self {
        self.negotiation_depth = depth.max(1);
        self
    }

    /// Sets the push batch size.
    #[must_use]
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the apply chunk size.
    #[must_use]
    pub fn with_apply_chunk_size(mut self, size: usize) -> Self {
        self.apply_chunk_size = size.max(1);
        self
    }

    /// Sets the maximum number of passes.
    #[must_use]
    pub fn with_max_passes(mut self, passes: u32) -> Self {
        self.max_passes = passes.max(1);
        self
    }

    /// Sets the maximum number of prefixes per request.
    #[must_use]
    pub fn with_max_prefixes_per_request(mut self, max: usize) -> Self {
        self.max_prefixes_per_request = max.max(1);
        self
    }

    /// Sets every per-state timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.clock_timeout = timeout;
        self.negotiation_timeout = timeout;
        self.exchange_timeout = timeout;
        self
    }

    /// Sets the clock exchange timeout.
    #[must_use]
    pub fn with_clock_timeout(mut self, timeout: Duration) -> Self {
        self.clock_timeout = timeout;
        self
    }

    /// Sets the negotiation timeout.
    #[must_use]
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Sets the message exchange timeout.
    #[must_use]
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Timeout for a round trip sent while in `state`.
    #[must_use]
    pub fn timeout_for(&self, state: SessionState) -> Duration {
        match state {
            SessionState::ClockExchange => self.clock_timeout,
            SessionState::TrieNegotiation => self.negotiation_timeout,
            _ => self.exchange_timeout,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_negotiation_depth(6)
            .with_push_batch_size(50)
            .with_apply_chunk_size(0)
            .with_max_passes(3)
            .with_timeout(Duration::from_secs(5))
            .with_exchange_timeout(Duration::from_secs(60));

        assert_eq!(config.negotiation_depth, 6);
        assert_eq!(config.push_batch_size, 50);
        assert_eq!(config.apply_chunk_size, 1);
        assert_eq!(config.max_passes, 3);
        assert_eq!(config.timeout_for(SessionState::ClockExchange), Duration::from_secs(5));
        assert_eq!(config.timeout_for(SessionState::TrieNegotiation), Duration::from_secs(5));
        assert_eq!(config.timeout_for(SessionState::MessageExchange), Duration::from_secs(60));
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.negotiation_depth, 4);
        assert_eq!(config.push_batch_size, 500);
        assert_eq!(config.max_passes, 10);
        assert_eq!(config.timeout_for(SessionState::Applying), Duration::from_secs(30));
    }
}
