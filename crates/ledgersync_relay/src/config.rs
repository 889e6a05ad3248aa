//! Relay configuration.

use ledgersync_crdt::KEY_DEPTH;
use ledgersync_engine::ResponderLimits;

/// Configuration for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum messages accepted in one push.
    pub max_push_batch: usize,
    /// Maximum prefixes accepted in one trie or fetch request.
    pub max_fetch_prefixes: usize,
    /// Deepest trie window served per prefix.
    pub max_trie_depth: u8,
    /// Queued requests before senders wait.
    pub queue_capacity: usize,
}

impl RelayConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_push_batch: 5000,
            max_fetch_prefixes: 256,
            max_trie_depth: 8,
            queue_capacity: 100,
        }
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Sets the maximum number of prefixes per request.
    pub fn with_max_fetch_prefixes(mut self, max: usize) -> Self {
        self.max_fetch_prefixes = max;
        self
    }

    /// Sets the deepest trie window.
    pub fn with_max_trie_depth(mut self, depth: u8) -> Self {
        self.max_trie_depth = depth;
        self
    }

    /// Sets the request queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Returns an error message if a limit is unusable.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_push_batch == 0 {
            return Err("max_push_batch must be positive".into());
        }
        if self.max_fetch_prefixes == 0 {
            return Err("max_fetch_prefixes must be positive".into());
        }
        if self.max_trie_depth == 0 || self.max_trie_depth as usize > KEY_DEPTH {
            return Err(format!("max_trie_depth must be within 1..={KEY_DEPTH}"));
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be positive".into());
        }
        Ok(())
    }

    /// The limits handed to the responder.
    pub fn limits(&self) -> ResponderLimits {
        ResponderLimits {
            max_trie_depth: self.max_trie_depth,
            max_prefixes: self.max_fetch_prefixes,
            max_push_batch: self.max_push_batch,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new()
    }
}
