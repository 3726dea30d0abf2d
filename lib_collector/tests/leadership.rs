//! Lease contention between several instances sharing one store.

use std::sync::Arc;
use std::time::Duration;

use lib_collector::connections::memory::MemoryKvStore;
use lib_collector::core::leadership::{lease_key, LeadershipLock};
use lib_collector::KvStore;

const TTL: Duration = Duration::from_secs(20);

fn contenders(kv: &Arc<MemoryKvStore>, n: usize) -> Vec<LeadershipLock> {
    (0..n)
        .map(|i| LeadershipLock::new(kv.clone(), "hostsnap", format!("node-{i}"), TTL))
        .collect()
}

async fn poll_all(locks: &[LeadershipLock]) -> usize {
    let mut leaders = 0;
    for lock in locks {
        if lock.try_acquire_or_renew().await.unwrap() {
            leaders += 1;
        }
    }
    leaders
}

#[tokio::test(start_paused = true)]
async fn at_most_one_leader_across_polls() {
    let kv = Arc::new(MemoryKvStore::new());
    let locks = contenders(&kv, 5);

    for _ in 0..10 {
        assert_eq!(poll_all(&locks).await, 1);
        assert_eq!(locks.iter().filter(|l| l.is_leader()).count(), 1);
        tokio::time::advance(Duration::from_secs(10)).await;
    }
    let holder = kv.get(&lease_key("hostsnap")).await.unwrap().unwrap();
    assert_eq!(holder, "node-0");
}

#[tokio::test(start_paused = true)]
async fn released_lease_passes_to_another_instance() {
    let kv = Arc::new(MemoryKvStore::new());
    let locks = contenders(&kv, 3);
    assert_eq!(poll_all(&locks).await, 1);

    locks[0].relinquish().await.unwrap();
    assert!(!locks[0].is_leader());
    assert_eq!(poll_all(&locks[1..]).await, 1);
    assert!(locks[1].is_leader());
    assert!(!locks[0].try_acquire_or_renew().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn silent_leader_loses_the_lease_after_expiry() {
    let kv = Arc::new(MemoryKvStore::new());
    let locks = contenders(&kv, 2);
    assert!(locks[0].try_acquire_or_renew().await.unwrap());

    tokio::time::advance(TTL + Duration::from_secs(1)).await;
    assert!(locks[1].try_acquire_or_renew().await.unwrap());
    assert!(!locks[0].try_acquire_or_renew().await.unwrap());
    assert!(!locks[0].is_leader());
}

#[tokio::test]
async fn concurrent_contenders_elect_one() {
    let kv = Arc::new(MemoryKvStore::new());
    let locks: Vec<_> = contenders(&kv, 8).into_iter().map(Arc::new).collect();
    let attempts: Vec<_> = locks
        .iter()
        .map(|lock| {
            let lock = Arc::clone(lock);
            tokio::spawn(async move { lock.try_acquire_or_renew().await.unwrap() })
        })
        .collect();
    let mut winners = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
