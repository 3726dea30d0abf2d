//! # Channel Health Check
//!
//! Periodically writes a status code for the snapshot channel into the shared
//! KV store, where operators and the rest of the platform read it.
//!
//! Every instance runs the checker, but only the current leader writes: the
//! status describes the subscription, and a follower has none.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::leadership::LeadershipLock;
use crate::core::stats::PipelineStats;
use crate::storage::{ChannelSource, KvStore};

/// Channel and stores are healthy.
pub const STATUS_OK: i64 = 0;
/// Leader has received nothing for longer than the empty threshold.
pub const STATUS_CHANNEL_EMPTY: i64 = 1_106_019;
/// The channel source or the KV store is unreachable.
pub const STATUS_STORE_UNREACHABLE: i64 = 1_106_020;

/// How long a leader may go without messages before the channel counts as empty.
pub const EMPTY_AFTER: Duration = Duration::from_secs(60);
/// Expiry of the status key.
pub const STATUS_TTL: Duration = Duration::from_secs(120);

/// Status key for a collector.
pub fn channel_status_key(collector: &str) -> String {
    format!("cc:v3:{collector}:channelstatus")
}

/// # Health Checker
pub struct HealthChecker {
    key: String,
    source: Arc<dyn ChannelSource>,
    kv: Arc<dyn KvStore>,
    lock: Arc<LeadershipLock>,
    stats: Arc<PipelineStats>,
}

impl HealthChecker {
    /// Creates a checker for `collector`.
    pub fn new(
        collector: &str,
        source: Arc<dyn ChannelSource>,
        kv: Arc<dyn KvStore>,
        lock: Arc<LeadershipLock>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self { key: channel_status_key(collector), source, kv, lock, stats }
    }

    /// Computes the current status code.
    pub async fn status(&self) -> i64 {
        if let Err(e) = self.source.ping().await {
            warn!(error = %e, "snapshot channel unreachable");
            return STATUS_STORE_UNREACHABLE;
        }
        if let Err(e) = self.kv.ping().await {
            warn!(error = %e, "kv store unreachable");
            return STATUS_STORE_UNREACHABLE;
        }
        if self.lock.is_leader() {
            let silent = self
                .stats
                .last_message_at()
                .map_or(true, |at| at.elapsed() > EMPTY_AFTER);
            if silent {
                warn!("snapshot channel empty for more than {:?}", EMPTY_AFTER);
                return STATUS_CHANNEL_EMPTY;
            }
        }
        STATUS_OK
    }

    /// Computes the status and writes it to the status key.
    ///
    /// Returns the written code, or `None` when this instance is not leader
    /// and the key was left alone.
    pub async fn check_once(&self) -> Option<i64> {
        if !self.lock.is_leader() {
            debug!(key = %self.key, "not leader, channel status left to the leader");
            return None;
        }
        let code = self.status().await;
        if let Err(e) = self.kv.set_ex(&self.key, &code.to_string(), STATUS_TTL).await {
            warn!(error = %e, key = %self.key, "failed to write channel status");
        } else {
            debug!(code, "channel status written");
        }
        Some(code)
    }

    /// Checks every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::{MemoryChannel, MemoryKvStore};

    struct Fixture {
        checker: HealthChecker,
        kv: Arc<MemoryKvStore>,
        hub: Arc<MemoryChannel>,
        lock: Arc<LeadershipLock>,
        stats: Arc<PipelineStats>,
    }

    fn instance(kv: &Arc<MemoryKvStore>, hub: &Arc<MemoryChannel>, identity: &str) -> Fixture {
        let lock = Arc::new(LeadershipLock::new(kv.clone(), "hs", identity, Duration::from_secs(20)));
        let stats = Arc::new(PipelineStats::new());
        let checker = HealthChecker::new("hs", hub.clone(), kv.clone(), lock.clone(), stats.clone());
        Fixture { checker, kv: kv.clone(), hub: hub.clone(), lock, stats }
    }

    fn fixture() -> Fixture {
        instance(&Arc::new(MemoryKvStore::new()), &Arc::new(MemoryChannel::new()), "me")
    }

    async fn status_key(kv: &MemoryKvStore) -> Option<String> {
        kv.get(&channel_status_key("hs")).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn leader_without_traffic_reports_empty() {
        let f = fixture();
        assert!(f.lock.try_acquire_or_renew().await.unwrap());
        assert_eq!(f.checker.check_once().await, Some(STATUS_CHANNEL_EMPTY));

        f.stats.record_received();
        assert_eq!(f.checker.check_once().await, Some(STATUS_OK));
        tokio::time::advance(EMPTY_AFTER + Duration::from_secs(1)).await;
        assert_eq!(f.checker.check_once().await, Some(STATUS_CHANNEL_EMPTY));
        assert_eq!(status_key(&f.kv).await.as_deref(), Some("1106019"));
    }

    #[tokio::test]
    async fn follower_does_not_write_status() {
        let f = fixture();
        assert_eq!(f.checker.check_once().await, None);
        assert_eq!(status_key(&f.kv).await, None);
    }

    #[tokio::test]
    async fn follower_leaves_the_leader_status_in_place() {
        let kv = Arc::new(MemoryKvStore::new());
        let hub = Arc::new(MemoryChannel::new());
        let leader = instance(&kv, &hub, "leader");
        let follower = instance(&kv, &hub, "follower");
        assert!(leader.lock.try_acquire_or_renew().await.unwrap());
        assert!(!follower.lock.try_acquire_or_renew().await.unwrap());

        assert_eq!(leader.checker.check_once().await, Some(STATUS_CHANNEL_EMPTY));
        assert_eq!(follower.checker.check_once().await, None);
        assert_eq!(status_key(&kv).await.as_deref(), Some("1106019"));
    }

    #[tokio::test]
    async fn unreachable_channel_is_reported() {
        let f = fixture();
        assert!(f.lock.try_acquire_or_renew().await.unwrap());
        f.hub.set_unavailable(true);
        assert_eq!(f.checker.check_once().await, Some(STATUS_STORE_UNREACHABLE));
        assert_eq!(status_key(&f.kv).await.as_deref(), Some("1106020"));
    }
}
