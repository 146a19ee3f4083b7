//! Configuration for the dispatch and cache core.

use std::time::Duration;

/// Enumerated options for the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum recursion depth; a dispatch that would exceed it fails with
    /// `ExhaustedDepth`.
    pub max_depth: u32,
    /// Hard cap on concurrently evaluated children per node.
    pub max_dispatch_fanout: usize,
    /// Entries in the shared dispatch cache.
    pub request_cache_capacity: u64,
    /// Staleness budget added to the datastore's revision validity.
    pub max_revision_staleness: Duration,
    /// Maximum results per Lookup request when the caller gives no limit.
    pub default_limit: u32,
    /// Per-request deadline.
    pub request_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_dispatch_fanout: 16,
            request_cache_capacity: 10_000,
            max_revision_staleness: Duration::ZERO,
            default_limit: 1_000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatchConfig {
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_dispatch_fanout(mut self, fanout: usize) -> Self {
        self.max_dispatch_fanout = fanout.max(1);
        self
    }

    pub fn with_request_cache_capacity(mut self, capacity: u64) -> Self {
        self.request_cache_capacity = capacity;
        self
    }

    pub fn with_max_revision_staleness(mut self, staleness: Duration) -> Self {
        self.max_revision_staleness = staleness;
        self
    }

    pub fn with_default_limit(mut self, limit: u32) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
