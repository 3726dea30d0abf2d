//! End-to-end runs of the collector against the in-memory adapters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lib_collector::connections::memory::{MemoryChannel, MemoryHostStore, MemoryKvStore, MemoryModelStore};
use lib_collector::core::collector::CollectorRole;
use lib_collector::core::intake::IntakeQueue;
use lib_collector::core::leadership::lease_key;
use lib_collector::core::reference_cache::{cache_key, ReferenceCache};
use lib_collector::snapshot::encode_envelope;
use lib_collector::{
    Collector, CollectorDeps, CollectorError, CollectorSettings, FieldMap, HostFilter, HostRecord, HostStore,
    KvStore, Page, StoreError, Stream,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const CHANNEL: &str = "2_snapshot";

struct Harness {
    kv: Arc<MemoryKvStore>,
    hub: Arc<MemoryChannel>,
    store: Arc<MemoryHostStore>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryHostStore::new());
        store.insert(HostRecord::new(42, 0, "192.168.1.7"));
        Self { kv: Arc::new(MemoryKvStore::new()), hub: Arc::new(MemoryChannel::new()), store }
    }

    fn deps(&self) -> CollectorDeps {
        CollectorDeps {
            kv: self.kv.clone(),
            source: self.hub.clone(),
            store: self.store.clone(),
            stream: Stream::HostSnapshot,
        }
    }

    fn collector(&self, identity: &str, shutdown: &CancellationToken) -> Arc<Collector> {
        self.collector_with(settings(), self.deps(), identity, shutdown)
    }

    fn collector_with(
        &self,
        settings: CollectorSettings,
        deps: CollectorDeps,
        identity: &str,
        shutdown: &CancellationToken,
    ) -> Arc<Collector> {
        Arc::new(Collector::new(settings, vec![CHANNEL.to_string()], deps, identity, shutdown.clone()))
    }
}

fn spawn_run(collector: &Arc<Collector>) -> tokio::task::JoinHandle<Result<(), CollectorError>> {
    let collector = Arc::clone(collector);
    tokio::spawn(async move { collector.run().await })
}

fn settings() -> CollectorSettings {
    CollectorSettings {
        name: "pipeline".to_string(),
        batch_size: 10,
        max_concurrency: 4,
        leader_poll: Duration::from_millis(50),
        lease_ttl: Duration::from_millis(500),
        batch_window: Duration::from_millis(20),
        submit_poll: Duration::from_millis(10),
        receive_timeout: Duration::from_millis(50),
        ..CollectorSettings::default()
    }
}

fn snapshot(ip: &str) -> String {
    encode_envelope(&json!({
        "ip": ip,
        "cloudid": 0,
        "data": {
            "cpu": { "cpuinfo": [ { "cores": 1, "modelName": "Intel Xeon", "mhz": "2394.446" } ] },
            "mem": { "meminfo": { "total": 1044832256u64 } },
            "system": { "info": { "hostname": "node-7", "os": "linux", "platform": "centos" } }
        }
    }))
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn published_snapshot_updates_host_once() {
    let h = Harness::new();
    let shutdown = CancellationToken::new();
    let collector = h.collector("node-a", &shutdown);
    let runner = tokio::spawn({
        let collector = Arc::clone(&collector);
        async move { collector.run().await }
    });

    eventually("subscription", || h.hub.subscriber_count() == 1).await;
    assert_eq!(collector.role().await, CollectorRole::Leader);

    h.hub.publish(CHANNEL, snapshot("192.168.1.7"));
    eventually("host update", || h.store.update_count() == 1).await;
    let host = h.store.host(42).unwrap();
    assert_eq!(host.attributes["bk_cpu"], json!(1));
    assert_eq!(host.attributes["bk_mem"], json!(996));
    assert_eq!(host.attributes["bk_host_name"], json!("node-7"));

    h.hub.publish(CHANNEL, snapshot("192.168.1.7"));
    eventually("unchanged snapshot", || collector.stats().snapshot().unchanged == 1).await;
    assert_eq!(h.store.update_count(), 1);
    assert!(h.kv.get("cc:v3:snapshot:42").await.unwrap().is_some());

    shutdown.cancel();
    runner.await.unwrap().unwrap();
    assert_eq!(h.kv.get(&lease_key("pipeline")).await.unwrap(), None);
}

#[tokio::test]
async fn unknown_ip_is_counted_unresolved() {
    let h = Harness::new();
    let shutdown = CancellationToken::new();
    let collector = h.collector("node-a", &shutdown);
    let runner = tokio::spawn({
        let collector = Arc::clone(&collector);
        async move { collector.run().await }
    });

    collector.mock(snapshot("10.9.9.9"));
    eventually("unresolved", || collector.stats().snapshot().unresolved == 1).await;
    assert_eq!(h.store.update_count(), 0);

    shutdown.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn only_one_of_two_collectors_subscribes() {
    let h = Harness::new();
    let shutdown = CancellationToken::new();
    let a = h.collector("node-a", &shutdown);
    let b = h.collector("node-b", &shutdown);
    let runners: Vec<_> = [Arc::clone(&a), Arc::clone(&b)]
        .into_iter()
        .map(|c| tokio::spawn(async move { c.run().await }))
        .collect();

    eventually("a leader", || h.hub.subscriber_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.hub.subscriber_count(), 1);

    let roles = [a.role().await, b.role().await];
    assert_eq!(roles.iter().filter(|r| **r == CollectorRole::Leader).count(), 1);
    let holder = h.kv.get(&lease_key("pipeline")).await.unwrap().unwrap();
    assert!(holder == a.identity() || holder == b.identity());

    shutdown.cancel();
    for runner in runners {
        runner.await.unwrap().unwrap();
    }
}

#[test]
fn intake_stays_bounded_under_a_burst() {
    let intake = IntakeQueue::new(100);
    let mut evicted = 0;
    for i in 0..1000 {
        let report = intake.push(i.to_string());
        assert!(report.len <= 200, "queue grew to {}", report.len);
        evicted += report.evicted;
    }
    assert_eq!(evicted + intake.len(), 1000);
    assert!(intake.len() <= intake.capacity());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_a_half_built_generation() {
    let store = Arc::new(MemoryHostStore::new());
    for id in 1..=500 {
        store.insert(HostRecord::new(id, 0, format!("10.1.{}.{}", id / 256, id % 256)));
    }
    let cache = Arc::new(ReferenceCache::new(store.clone(), 50));
    cache.rebuild().await.unwrap();

    let stop = CancellationToken::new();
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let (cache, stop) = (Arc::clone(&cache), stop.clone());
            tokio::spawn(async move {
                let mut reads = 0u64;
                loop {
                    for id in [1i64, 250, 500] {
                        let key = cache_key(0, &format!("10.1.{}.{}", id / 256, id % 256));
                        let entry = cache.get(&key).expect("seeded host missing during rebuild");
                        assert_eq!(entry.host_id(), id);
                    }
                    assert!(cache.len() >= 500);
                    reads += 1;
                    if stop.is_cancelled() {
                        break reads;
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for round in 0..20 {
        store.insert(HostRecord::new(1000 + round, 0, format!("10.2.0.{round}")));
        assert_eq!(cache.rebuild().await.unwrap(), 501 + round as usize);
    }
    stop.cancel();
    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
    assert!(cache.get(&cache_key(0, "10.2.0.19")).is_some());
}

#[tokio::test]
async fn channel_fault_hands_the_lease_to_a_healthy_instance() {
    let h = Harness::new();
    let shutdown = CancellationToken::new();
    let slow_expiry = CollectorSettings { lease_ttl: Duration::from_secs(60), ..settings() };

    let broken_hub = Arc::new(MemoryChannel::new());
    broken_hub.set_unavailable(true);
    let broken = h.collector_with(
        slow_expiry.clone(),
        CollectorDeps { source: broken_hub.clone(), ..h.deps() },
        "node-broken",
        &shutdown,
    );
    let broken_runner = spawn_run(&broken);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The lease outlives the test, so only a concede can free it.
    let healthy = h.collector_with(slow_expiry, h.deps(), "node-healthy", &shutdown);
    let healthy_runner = spawn_run(&healthy);

    eventually("healthy subscription", || h.hub.subscriber_count() == 1).await;
    assert_eq!(h.kv.get(&lease_key("pipeline")).await.unwrap().as_deref(), Some("node-healthy"));
    assert_eq!(healthy.role().await, CollectorRole::Leader);
    assert_eq!(broken.role().await, CollectorRole::Follower);
    assert_eq!(broken_hub.subscriber_count(), 0);

    shutdown.cancel();
    broken_runner.await.unwrap().unwrap();
    healthy_runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn overload_releases_the_lease() {
    let h = Harness::new();
    let shutdown = CancellationToken::new();
    let fragile = CollectorSettings {
        batch_size: 1,
        max_concurrency: 1,
        leader_poll: Duration::from_secs(3),
        lease_ttl: Duration::from_secs(60),
        overload_relinquish_after: 1,
        ..settings()
    };
    let collector = h.collector_with(fragile, h.deps(), "node-a", &shutdown);
    let runner = spawn_run(&collector);

    eventually("subscription", || h.hub.subscriber_count() == 1).await;
    assert_eq!(collector.role().await, CollectorRole::Leader);
    for _ in 0..500 {
        h.hub.publish(CHANNEL, snapshot("192.168.1.7"));
    }

    eventually("stalled intake", || collector.stats().snapshot().resets >= 1).await;
    let released = tokio::time::timeout(Duration::from_secs(2), async {
        while h.kv.get(&lease_key("pipeline")).await.unwrap().is_some()
            || collector.role().await != CollectorRole::Follower
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "overloaded leader kept the lease");
    eventually("subscription closed", || h.hub.subscriber_count() == 0).await;

    shutdown.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn lease_store_failure_ends_start() {
    let h = Harness::new();
    h.kv.set_unavailable(true);
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        Collector::start(settings(), vec![CHANNEL.to_string()], h.deps(), CancellationToken::new()),
    )
    .await
    .expect("start kept running on a dead lease store");
    let err = outcome.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, CollectorError::Lease(_)));
}

/// Host store whose second query panics, which takes the cache refresh task down.
struct PanicOnSecondQuery {
    inner: Arc<MemoryHostStore>,
    calls: AtomicUsize,
}

#[async_trait]
impl HostStore for PanicOnSecondQuery {
    async fn query_hosts(
        &self,
        filter: &HostFilter,
        fields: &[&str],
        page: Option<Page>,
    ) -> Result<Vec<HostRecord>, StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
            panic!("host store lost its connection mid-refresh");
        }
        self.inner.query_hosts(filter, fields, page).await
    }

    async fn update_host(&self, host_id: i64, fields: &FieldMap) -> Result<(), StoreError> {
        self.inner.update_host(host_id, fields).await
    }

    async fn default_app_id(&self) -> Result<Option<i64>, StoreError> {
        self.inner.default_app_id().await
    }
}

#[tokio::test]
async fn start_restarts_after_a_background_task_dies() {
    let h = Harness::new();
    let store = Arc::new(PanicOnSecondQuery { inner: h.store.clone(), calls: AtomicUsize::new(0) });
    let restartable = CollectorSettings {
        cache_refresh: Duration::from_millis(100),
        restart_delay: Duration::from_millis(50),
        ..settings()
    };
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(Collector::start(
        restartable,
        vec![CHANNEL.to_string()],
        CollectorDeps { store: store.clone(), ..h.deps() },
        shutdown.clone(),
    ));

    // The third query is the replacement instance warming its cache.
    eventually("replacement instance", || store.calls.load(Ordering::SeqCst) >= 3).await;
    eventually("resubscription", || h.hub.subscriber_count() == 1).await;
    h.hub.publish(CHANNEL, snapshot("192.168.1.7"));
    eventually("host update after restart", || h.store.update_count() == 1).await;
    assert!(!runner.is_finished());

    shutdown.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn discovery_collector_creates_then_leaves_instances() {
    let h = Harness::new();
    let models = Arc::new(MemoryModelStore::new());
    models.add_unique("mysql", &["ip_addr", "port_num"]);
    let deps = CollectorDeps { stream: Stream::Discovery(models.clone()), ..h.deps() };
    let discover = CollectorSettings { name: "discover".to_string(), ..settings() };
    let shutdown = CancellationToken::new();
    let collector = h.collector_with(discover, deps, "node-a", &shutdown);
    let runner = spawn_run(&collector);

    eventually("subscription", || h.hub.subscriber_count() == 1).await;
    let message = json!({
        "type": "bkdiscover",
        "data": {
            "data": { "ip_addr": "10.0.1.234", "port_num": "3306", "bk_inst_name": "mysql-1" },
            "meta": { "model": { "bk_obj_id": "mysql" } }
        }
    })
    .to_string();
    h.hub.publish(CHANNEL, message.clone());
    eventually("instance created", || models.create_count() == 1).await;
    h.hub.publish(CHANNEL, message);
    eventually("unchanged instance", || collector.stats().snapshot().unchanged == 1).await;

    assert_eq!(collector.stats().snapshot().created, 1);
    assert_eq!(models.update_count(), 0);
    assert_eq!(h.store.query_count(), 0);
    assert!(h.kv.get(&lease_key("discover")).await.unwrap().is_some());

    shutdown.cancel();
    runner.await.unwrap().unwrap();
}
