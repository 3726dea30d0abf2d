//! # Host Snapshot Handler
//!
//! The per-message unit of work run by the worker pool:
//! decode, resolve, cache the raw copy, map attributes, diff, write.
//! Each message is independent; a failure affects only that message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::reference_cache::ReferenceCache;
use crate::core::worker_pool::{HandleError, HandleOutcome, MessageHandler};
use crate::snapshot::decoder::Snapshot;
use crate::snapshot::field_map::extract_attributes;
use crate::storage::{HostStore, KvStore};

/// Key under which the latest raw snapshot of a host is kept.
pub fn snapshot_key(host_id: i64) -> String {
    format!("cc:v3:snapshot:{host_id}")
}

/// Resolves host snapshots against the reference cache and writes changes.
pub struct HostSnapHandler {
    cache: Arc<ReferenceCache>,
    kv: Arc<dyn KvStore>,
    store: Arc<dyn HostStore>,
    snapshot_ttl: Duration,
}

impl HostSnapHandler {
    /// Creates a handler sharing `cache` with the collector's refresh loop.
    pub fn new(
        cache: Arc<ReferenceCache>,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn HostStore>,
        snapshot_ttl: Duration,
    ) -> Self {
        Self { cache, kv, store, snapshot_ttl }
    }
}

#[async_trait]
impl MessageHandler for HostSnapHandler {
    async fn handle(&self, raw: &str) -> Result<HandleOutcome, HandleError> {
        // --- Phase 1: Decode ---
        let snapshot = Snapshot::decode(raw)?;
        let cloud_id = snapshot.cloud_id();
        let ips = snapshot.candidate_ips();
        if ips.is_empty() {
            warn!(cloud_id, "snapshot carries no usable ip");
            return Ok(HandleOutcome::Skipped("no ip"));
        }

        // --- Phase 2: Resolve ---
        let owner = snapshot.owner_id();
        let Some(host) = self.cache.lookup_or_fetch(&cloud_id, &ips, owner.as_deref()).await? else {
            debug!(cloud_id, ?ips, "host not found in cache or store");
            return Ok(HandleOutcome::Unresolved);
        };
        let host_id = host.host_id();

        // --- Phase 3: Keep the raw copy ---
        let key = snapshot_key(host_id);
        if let Err(e) = self.kv.set_ex(&key, snapshot.raw_body(), self.snapshot_ttl).await {
            warn!(host_id, error = %e, "failed to cache raw snapshot");
        }

        if host.inner_ip().is_empty() {
            return Ok(HandleOutcome::Skipped("host has no inner ip"));
        }

        // --- Phase 4: Map and diff ---
        let fresh = extract_attributes(snapshot.body(), host.inner_ip(), host.outer_ip()).into_field_map();
        let changed = host.diff(&fresh);
        if changed.is_empty() {
            debug!(host_id, timestamp = ?snapshot.timestamp(), "no need to update");
            return Ok(HandleOutcome::Unchanged { id: host_id });
        }

        // --- Phase 5: Write ---
        self.store.update_host(host_id, &changed).await?;
        host.apply(&changed);
        Ok(HandleOutcome::Updated { id: host_id, changed: changed.len() })
    }
}
