//! # Collector Settings
//!
//! Resolved pipeline tunables. Built from `CollectorConfig` in production and
//! constructed directly (usually from `Default`) in tests.

use std::time::Duration;

/// Batch size the service uses when none is configured.
pub const DEFAULT_BATCH_SIZE: usize = 2000;
/// Batch size substituted for an explicit zero.
pub const FALLBACK_BATCH_SIZE: usize = 100;

/// Every knob the engine reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorSettings {
    /// Logical collector name; namespaces the lease and status keys.
    pub name: String,
    /// Maximum messages per batch; also sizes the intake queue.
    pub batch_size: usize,
    /// Worker pool ceiling.
    pub max_concurrency: usize,
    /// How often the leader loop ticks.
    pub leader_poll: Duration,
    /// Lease time-to-live; longer than `leader_poll`.
    pub lease_ttl: Duration,
    /// Reference cache rebuild interval.
    pub cache_refresh: Duration,
    /// Page size for the cache rebuild.
    pub fetch_page_size: u64,
    /// Expiry of the raw snapshot copy kept in the KV store.
    pub snapshot_ttl: Duration,
    /// How long a batch stays open after its first message.
    pub batch_window: Duration,
    /// Worker pool submission poll interval.
    pub submit_poll: Duration,
    /// Bound on a single blocking channel read.
    pub receive_timeout: Duration,
    /// Channel status check interval.
    pub health_check: Duration,
    /// Consecutive stalled evictions before leadership is relinquished.
    pub overload_relinquish_after: u32,
    /// Delay before a supervised restart.
    pub restart_delay: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        let leader_poll = Duration::from_secs(10);
        Self {
            name: "hostsnap".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrency: std::thread::available_parallelism().map_or(1, |n| n.get()),
            leader_poll,
            lease_ttl: leader_poll + Duration::from_secs(10),
            cache_refresh: Duration::from_secs(600),
            fetch_page_size: 1000,
            snapshot_ttl: Duration::from_secs(600),
            batch_window: Duration::from_millis(1000),
            submit_poll: Duration::from_millis(100),
            receive_timeout: Duration::from_secs(10),
            health_check: Duration::from_secs(60),
            overload_relinquish_after: 3,
            restart_delay: Duration::from_secs(10),
        }
    }
}

impl CollectorSettings {
    /// Batch size with the zero substitution applied.
    pub fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            FALLBACK_BATCH_SIZE
        } else {
            self.batch_size
        }
    }

    /// Worker ceiling, never below one.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}
