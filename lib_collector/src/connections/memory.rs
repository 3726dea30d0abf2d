//! # In-Memory Adapters
//!
//! Process-local implementations of [`KvStore`], [`ChannelSource`],
//! [`HostStore`] and [`ModelStore`]. They follow the same semantics as the network adapters
//! (expiring keys, fan-out pub/sub, projected and paginated queries) and are
//! what the test suites and `Collector::mock` runs use.
//!
//! Expiry is measured with `tokio::time::Instant`, so paused-clock tests can
//! advance past a lease TTL without sleeping.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use serde_json::Value;

use crate::storage::{
    ChannelError, ChannelSource, FieldMap, HostFilter, HostRecord, HostStore, KvStore, ModelStore, Page,
    StoreError, Subscription, FIELD_INST_ID, FIELD_OBJ_ID,
};

// ==========================================
// Key-value store
// ==========================================

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Expiring string map.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with a connection error (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining time-to-live of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.expires_at - now)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store marked unavailable".into()));
        }
        Ok(())
    }

    /// Runs `f` on the live entries, after dropping expired ones.
    fn with_live<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T) -> T {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, e| e.expires_at > now);
        f(&mut entries, now)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self.with_live(|entries, _| entries.get(key).map(|e| e.value.clone())))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        self.with_live(|entries, now| {
            entries.insert(
                key.to_string(),
                Entry { value: value.to_string(), expires_at: now + ttl },
            );
        });
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.with_live(|entries, now| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry { value: value.to_string(), expires_at: now + ttl },
            );
            true
        }))
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.with_live(|entries, now| match entries.get_mut(key) {
            Some(e) if e.value == expected => {
                e.expires_at = now + ttl;
                true
            }
            _ => false,
        }))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.with_live(|entries, _| {
            if entries.get(key).is_some_and(|e| e.value == expected) {
                entries.remove(key);
                true
            } else {
                false
            }
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.with_live(|entries, _| entries.remove(key).is_some()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

// ==========================================
// Pub/sub hub
// ==========================================

const HUB_CAPACITY: usize = 16 * 1024;

/// Fan-out channel hub; every subscription sees every publish on its channels.
pub struct MemoryChannel {
    sender: broadcast::Sender<(String, String)>,
    unavailable: AtomicBool,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self { sender, unavailable: AtomicBool::new(false) }
    }
}

impl MemoryChannel {
    /// Creates a hub with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `payload` on `channel`, returning the number of live subscriptions.
    pub fn publish(&self, channel: &str, payload: impl Into<String>) -> usize {
        self.sender
            .send((channel.to_string(), payload.into()))
            .unwrap_or(0)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Makes `subscribe` and `ping` fail (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

/// Subscription handed out by [`MemoryChannel`].
pub struct MemorySubscription {
    channels: HashSet<String>,
    receiver: broadcast::Receiver<(String, String)>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Err(_) => return Err(ChannelError::Transient("receive timeout".into())),
                Ok(Ok((channel, payload))) => {
                    if self.channels.contains(&channel) {
                        return Ok(payload);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    return Err(ChannelError::Transient(format!("lagged by {n} messages")));
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(ChannelError::Closed),
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[async_trait]
impl ChannelSource for MemoryChannel {
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, ChannelError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ChannelError::Fatal("memory channel marked unavailable".into()));
        }
        Ok(Box::new(MemorySubscription {
            channels: channels.iter().cloned().collect(),
            receiver: self.sender.subscribe(),
        }))
    }

    async fn ping(&self) -> Result<(), ChannelError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ChannelError::Fatal("memory channel marked unavailable".into()));
        }
        Ok(())
    }
}

// ==========================================
// Host store
// ==========================================

/// Host registry keyed by host id.
#[derive(Default)]
pub struct MemoryHostStore {
    hosts: Mutex<BTreeMap<i64, HostRecord>>,
    default_app: Mutex<Option<i64>>,
    updates: AtomicUsize,
    queries: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryHostStore {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a host.
    pub fn insert(&self, record: HostRecord) {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        hosts.insert(record.bk_host_id, record);
    }

    /// Current copy of a host.
    pub fn host(&self, host_id: i64) -> Option<HostRecord> {
        let hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        hosts.get(&host_id).cloned()
    }

    /// Sets the default application id.
    pub fn set_default_app(&self, app_id: i64) {
        *self.default_app.lock().unwrap_or_else(PoisonError::into_inner) = Some(app_id);
    }

    /// Number of successful `update_host` calls so far.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of `query_hosts` calls so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Makes every subsequent call fail with a connection error (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory host store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl HostStore for MemoryHostStore {
    async fn query_hosts(
        &self,
        filter: &HostFilter,
        fields: &[&str],
        page: Option<Page>,
    ) -> Result<Vec<HostRecord>, StoreError> {
        self.check()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        let hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        let matching = hosts.values().filter(|h| h.matches(filter));
        let (start, limit) = match page {
            Some(p) => (p.start as usize, p.limit as usize),
            None => (0, usize::MAX),
        };
        Ok(matching
            .skip(start)
            .take(limit)
            .map(|h| h.clone().project(fields))
            .collect())
    }

    async fn update_host(&self, host_id: i64, fields: &FieldMap) -> Result<(), StoreError> {
        self.check()?;
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        let host = hosts.get_mut(&host_id).ok_or(StoreError::NotFound(host_id))?;
        for (k, v) in fields {
            host.attributes.insert(k.clone(), v.clone());
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn default_app_id(&self) -> Result<Option<i64>, StoreError> {
        self.check()?;
        Ok(*self.default_app.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

// ==========================================
// Model store
// ==========================================

/// Model instances and their must-check unique rules.
#[derive(Default)]
pub struct MemoryModelStore {
    uniques: Mutex<HashMap<String, Vec<Vec<String>>>>,
    instances: Mutex<BTreeMap<i64, (String, FieldMap)>>,
    next_id: AtomicUsize,
    finds: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryModelStore {
    /// Creates a store with no models.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a must-check unique rule over `keys` for `obj_id`.
    pub fn add_unique(&self, obj_id: &str, keys: &[&str]) {
        let mut uniques = self.uniques.lock().unwrap_or_else(PoisonError::into_inner);
        uniques
            .entry(obj_id.to_string())
            .or_default()
            .push(keys.iter().map(|k| k.to_string()).collect());
    }

    /// Current copy of an instance.
    pub fn instance(&self, inst_id: i64) -> Option<FieldMap> {
        let instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        instances.get(&inst_id).map(|(_, data)| data.clone())
    }

    /// Number of `find_instance` calls so far.
    pub fn find_count(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    /// Number of successful `create_instance` calls so far.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of successful `update_instance` calls so far.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Makes every subsequent call fail with a connection error (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory model store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn must_check_uniques(&self, obj_id: &str, _owner_id: &str) -> Result<Vec<Vec<String>>, StoreError> {
        self.check()?;
        let uniques = self.uniques.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(uniques.get(obj_id).cloned().unwrap_or_default())
    }

    async fn find_instance(&self, obj_id: &str, cond: &FieldMap) -> Result<Option<FieldMap>, StoreError> {
        self.check()?;
        self.finds.fetch_add(1, Ordering::SeqCst);
        let instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(instances
            .values()
            .filter(|(obj, _)| obj == obj_id)
            .map(|(_, data)| data)
            .find(|data| cond.iter().all(|(k, v)| data.get(k) == Some(v)))
            .cloned())
    }

    async fn create_instance(&self, obj_id: &str, data: &FieldMap) -> Result<i64, StoreError> {
        self.check()?;
        let inst_id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        let mut doc = data.clone();
        doc.insert(FIELD_INST_ID.to_string(), Value::from(inst_id));
        doc.insert(FIELD_OBJ_ID.to_string(), Value::from(obj_id));
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        instances.insert(inst_id, (obj_id.to_string(), doc));
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(inst_id)
    }

    async fn update_instance(&self, obj_id: &str, inst_id: i64, data: &FieldMap) -> Result<(), StoreError> {
        self.check()?;
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, doc) = instances
            .get_mut(&inst_id)
            .filter(|(obj, _)| obj == obj_id)
            .ok_or(StoreError::NotFound(inst_id))?;
        for (k, v) in data {
            doc.insert(k.clone(), v.clone());
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
