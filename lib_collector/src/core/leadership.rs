//! # Leadership Lock
//!
//! Lease-based mutual exclusion across collector instances. The lease is one
//! key in the shared KV store holding the owner's identity with a TTL; only
//! the instance whose identity is stored may subscribe.
//!
//! ## Core Design Principles:
//! - **Set If Absent**: a follower becomes leader only through `SET NX EX`.
//! - **Owner-Checked Renewal**: a leader extends the TTL with an atomic
//!   compare-and-expire and then reads the key back. A lease that expired and
//!   was taken by someone else is never overwritten.
//! - **Owner-Checked Release**: relinquishing deletes the key only while it
//!   still holds our identity.
//! - **Single Writer**: the leader flag is written only by the leader loop and
//!   by relinquish; every other component just reads it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::storage::{KvStore, StoreError};

/// The lease store failed; callers treat this as fatal.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// A store call on the lease key failed.
    #[error("lease operation on {key} failed: {source}")]
    Store {
        /// Lease key.
        key: String,
        /// Underlying failure.
        #[source]
        source: StoreError,
    },
}

/// Lease key for a collector.
pub fn lease_key(collector: &str) -> String {
    format!("cc:v3:{collector}:masterlock")
}

/// # Leadership Lock
pub struct LeadershipLock {
    kv: Arc<dyn KvStore>,
    key: String,
    identity: String,
    ttl: Duration,
    leader: AtomicBool,
}

impl LeadershipLock {
    /// Creates a follower-state lock for `collector` owned by `identity`.
    pub fn new(kv: Arc<dyn KvStore>, collector: &str, identity: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            key: lease_key(collector),
            identity: identity.into(),
            ttl,
            leader: AtomicBool::new(false),
        }
    }

    /// This instance's identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The lease key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this instance believes it holds the lease.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// # Try Acquire or Renew
    ///
    /// ## Logic:
    /// 1. As leader: extend the TTL if the key is still ours, then read it back.
    ///    Either step failing to match means leadership was lost.
    /// 2. As follower: set the key if absent.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaseError> {
        if self.is_leader() {
            let renewed = self
                .kv
                .expire_if_equals(&self.key, &self.identity, self.ttl)
                .await
                .map_err(|e| self.store_error(e))?;
            let holder = self.kv.get(&self.key).await.map_err(|e| self.store_error(e))?;
            if renewed && holder.as_deref() == Some(self.identity.as_str()) {
                debug!(key = %self.key, "master check: still master");
                return Ok(true);
            }
            warn!(key = %self.key, holder = ?holder, identity = %self.identity, "leadership lost");
            self.leader.store(false, Ordering::Release);
            return Ok(false);
        }

        let acquired = self
            .kv
            .set_nx_ex(&self.key, &self.identity, self.ttl)
            .await
            .map_err(|e| self.store_error(e))?;
        if acquired {
            info!(key = %self.key, identity = %self.identity, "became master");
            self.leader.store(true, Ordering::Release);
        } else {
            debug!(key = %self.key, "another master holds the lease");
        }
        Ok(acquired)
    }

    /// # Relinquish
    ///
    /// Drops local leadership and deletes the lease if it still holds our identity.
    pub async fn relinquish(&self) -> Result<(), LeaseError> {
        self.leader.store(false, Ordering::Release);
        let deleted = self
            .kv
            .delete_if_equals(&self.key, &self.identity)
            .await
            .map_err(|e| self.store_error(e))?;
        info!(key = %self.key, deleted, "concede leadership");
        Ok(())
    }

    fn store_error(&self, source: StoreError) -> LeaseError {
        LeaseError::Store { key: self.key.clone(), source }
    }
}
