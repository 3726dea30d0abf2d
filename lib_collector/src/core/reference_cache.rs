//! # Reference Cache
//!
//! A double-buffered lookup table from `"<cloudID>::<innerIP>"` to the hosts
//! the collector may update.
//!
//! ## Core Design Principles:
//! - **Two Fixed Slots**: the table is an arena of two maps and a
//!   [`Generation`] flag naming the active one. A rebuild fills a fresh map
//!   off-lock, installs it in the standby slot and flips the flag in one short
//!   write-locked step, so readers only ever see a complete generation.
//! - **Fill Both on Miss**: an entry found by the database fallback is put into
//!   both slots, so the next flip does not forget it.
//! - **Shared Entries**: entries are `Arc<HostEntry>` with their own attribute
//!   lock; an update applied through one slot is visible through the other.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::snapshot::field_map::values_equal;
use crate::storage::{
    FieldMap, HostFilter, HostRecord, HostStore, Page, StoreError, FIELD_CLOUD_ID, FIELD_HOST_ID,
    FIELD_INNER_IP, FIELD_OUTER_IP,
};

/// Cache key for a host address.
pub fn cache_key(cloud_id: impl std::fmt::Display, inner_ip: &str) -> String {
    format!("{cloud_id}::{inner_ip}")
}

/// A cached host: identity is immutable, attributes change as updates land.
#[derive(Debug)]
pub struct HostEntry {
    host_id: i64,
    cloud_id: i64,
    inner_ip: String,
    outer_ip: String,
    attributes: RwLock<FieldMap>,
}

impl HostEntry {
    /// Builds an entry from a registry row.
    pub fn from_record(record: HostRecord) -> Self {
        Self {
            host_id: record.bk_host_id,
            cloud_id: record.bk_cloud_id,
            inner_ip: record.bk_host_innerip,
            outer_ip: record.bk_host_outerip,
            attributes: RwLock::new(record.attributes),
        }
    }

    /// Host id.
    pub fn host_id(&self) -> i64 {
        self.host_id
    }

    /// Cloud id.
    pub fn cloud_id(&self) -> i64 {
        self.cloud_id
    }

    /// Known inner IP.
    pub fn inner_ip(&self) -> &str {
        &self.inner_ip
    }

    /// Known outer IP, empty when unset.
    pub fn outer_ip(&self) -> &str {
        &self.outer_ip
    }

    /// This entry's cache key.
    pub fn key(&self) -> String {
        cache_key(self.cloud_id, &self.inner_ip)
    }

    /// Current value of one attribute.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            FIELD_HOST_ID => Some(Value::from(self.host_id)),
            FIELD_CLOUD_ID => Some(Value::from(self.cloud_id)),
            FIELD_INNER_IP => Some(Value::from(self.inner_ip.clone())),
            FIELD_OUTER_IP => Some(Value::from(self.outer_ip.clone())),
            _ => self.read().get(name).cloned(),
        }
    }

    /// The subset of `fresh` that differs from what is cached.
    pub fn diff(&self, fresh: &FieldMap) -> FieldMap {
        let attrs = self.read();
        fresh
            .iter()
            .filter(|(k, v)| !attrs.get(k.as_str()).is_some_and(|old| values_equal(v, old)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Copies written values into the cached attributes.
    pub fn apply(&self, fields: &FieldMap) {
        let mut attrs = self.attributes.write().unwrap_or_else(PoisonError::into_inner);
        for (k, v) in fields {
            attrs.insert(k.clone(), v.clone());
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, FieldMap> {
        self.attributes.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Names one of the two slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Slot 0.
    A,
    /// Slot 1.
    B,
}

impl Generation {
    fn index(self) -> usize {
        match self {
            Generation::A => 0,
            Generation::B => 1,
        }
    }

    fn other(self) -> Self {
        match self {
            Generation::A => Generation::B,
            Generation::B => Generation::A,
        }
    }
}

type HostMap = HashMap<String, Arc<HostEntry>>;

struct Slots {
    maps: [HostMap; 2],
    active: Generation,
}

/// # Reference Cache
pub struct ReferenceCache {
    slots: RwLock<Slots>,
    store: Arc<dyn HostStore>,
    page_size: u64,
}

impl ReferenceCache {
    /// Creates an empty cache backed by `store`.
    pub fn new(store: Arc<dyn HostStore>, page_size: u64) -> Self {
        Self {
            slots: RwLock::new(Slots { maps: [HostMap::new(), HostMap::new()], active: Generation::A }),
            store,
            page_size: page_size.max(1),
        }
    }

    /// Reads `key` from the active generation.
    pub fn get(&self, key: &str) -> Option<Arc<HostEntry>> {
        let slots = self.read();
        slots.maps[slots.active.index()].get(key).cloned()
    }

    /// Entries in the active generation.
    pub fn len(&self) -> usize {
        let slots = self.read();
        slots.maps[slots.active.index()].len()
    }

    /// True when the active generation is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Which slot readers currently see.
    pub fn active_generation(&self) -> Generation {
        self.read().active
    }

    /// Inserts an entry into both generations.
    pub fn insert(&self, entry: Arc<HostEntry>) {
        let key = entry.key();
        let mut slots = self.write();
        slots.maps[0].insert(key.clone(), Arc::clone(&entry));
        slots.maps[1].insert(key, entry);
    }

    /// # Lookup or Fetch
    ///
    /// ## Logic:
    /// 1. Try every candidate IP against the active generation.
    /// 2. On a miss, query the store by cloud id, inner IP set and owner.
    /// 3. Cache the first match in both generations and return it.
    ///
    /// A non-numeric cloud id cannot match any row and resolves to `None`.
    pub async fn lookup_or_fetch(
        &self,
        cloud_id: &str,
        ips: &[String],
        owner_id: Option<&str>,
    ) -> Result<Option<Arc<HostEntry>>, StoreError> {
        if let Some(hit) = ips.iter().find_map(|ip| self.get(&cache_key(cloud_id, ip))) {
            return Ok(Some(hit));
        }

        let Ok(cloud) = cloud_id.trim().parse::<i64>() else {
            debug!(cloud_id, "cloud id is not an integer");
            return Ok(None);
        };
        debug!(cloud, ?ips, "ips not in cache, querying store");
        let filter = HostFilter {
            cloud_id: Some(cloud),
            inner_ips: Some(ips.to_vec()),
            owner_id: owner_id.map(str::to_string),
        };
        let found = self.store.query_hosts(&filter, &[], None).await?;
        Ok(found.into_iter().next().map(|record| {
            let entry = Arc::new(HostEntry::from_record(record));
            self.insert(Arc::clone(&entry));
            entry
        }))
    }

    /// # Rebuild
    ///
    /// ## Logic:
    /// 1. Page through every host into a fresh map, off-lock.
    /// 2. Install it in the standby slot and flip, under one write lock.
    ///
    /// On a store error the active generation is left untouched.
    pub async fn rebuild(&self) -> Result<usize, StoreError> {
        let mut fresh = HostMap::new();
        let mut start = 0u64;
        loop {
            let page = Page { start, limit: self.page_size };
            let rows = self.store.query_hosts(&HostFilter::default(), &[], Some(page)).await?;
            let count = rows.len() as u64;
            for record in rows {
                let entry = HostEntry::from_record(record);
                fresh.insert(entry.key(), Arc::new(entry));
            }
            if count < self.page_size {
                break;
            }
            start += count;
        }

        let size = fresh.len();
        let mut slots = self.write();
        let standby = slots.active.other();
        slots.maps[standby.index()] = fresh;
        slots.active = standby;
        Ok(size)
    }

    /// Rebuilds every `interval` until `shutdown` fires.
    pub async fn run_refresh(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.rebuild().await {
                    Ok(size) => info!(size, generation = ?self.active_generation(), "reference cache refreshed"),
                    Err(e) => error!(error = %e, "reference cache refresh failed, keeping previous generation"),
                },
            }
        }
        warn!("reference cache refresh stopped");
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Slots> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::MemoryHostStore;
    use serde_json::json;

    fn seeded(n: i64) -> Arc<MemoryHostStore> {
        let store = Arc::new(MemoryHostStore::new());
        for id in 1..=n {
            store.insert(HostRecord::new(id, 0, format!("10.0.{}.{}", id / 256, id % 256)));
        }
        store
    }

    #[tokio::test]
    async fn rebuild_pages_and_flips() {
        let store = seeded(25);
        let cache = ReferenceCache::new(store.clone(), 10);
        assert_eq!(cache.active_generation(), Generation::A);
        assert_eq!(cache.rebuild().await.unwrap(), 25);
        assert_eq!(cache.active_generation(), Generation::B);
        assert_eq!(store.query_count(), 3);
        assert!(cache.get("0::10.0.0.25").is_some());
    }

    #[tokio::test]
    async fn miss_falls_back_and_survives_flip() {
        let store = Arc::new(MemoryHostStore::new());
        let cache = ReferenceCache::new(store.clone(), 10);
        cache.rebuild().await.unwrap();
        store.insert(HostRecord::new(9, 2, "172.16.0.9"));

        let ips = vec!["10.9.9.9".to_string(), "172.16.0.9".to_string()];
        let hit = cache.lookup_or_fetch("2", &ips, None).await.unwrap().unwrap();
        assert_eq!(hit.host_id(), 9);

        // A failed rebuild keeps the generation that holds the fetched entry.
        store.set_unavailable(true);
        assert!(cache.rebuild().await.is_err());
        assert!(cache.get("2::172.16.0.9").is_some());
    }

    #[tokio::test]
    async fn non_numeric_cloud_id_is_unresolved() {
        let cache = ReferenceCache::new(Arc::new(MemoryHostStore::new()), 10);
        let found = cache.lookup_or_fetch("abc", &["1.2.3.4".to_string()], None).await.unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn diff_reports_changed_fields_only() {
        let mut record = HostRecord::new(1, 0, "10.0.0.1");
        record.attributes.insert("bk_cpu".into(), json!(4.0));
        record.attributes.insert("bk_mem".into(), json!(512));
        let entry = HostEntry::from_record(record);

        let mut fresh = FieldMap::new();
        fresh.insert("bk_cpu".into(), json!(4));
        fresh.insert("bk_mem".into(), json!(1024));
        fresh.insert("bk_host_name".into(), json!("db-1"));
        let changed = entry.diff(&fresh);
        assert_eq!(changed.keys().collect::<Vec<_>>(), vec!["bk_host_name", "bk_mem"]);

        entry.apply(&changed);
        assert!(entry.diff(&fresh).is_empty());
    }
}
