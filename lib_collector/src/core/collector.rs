//! # Collector
//!
//! The central coordinator. It owns every pipeline component and drives the
//! Leader/Follower state machine:
//!
//! - **Follower**: the cache, dispatcher and health check run, but nothing
//!   subscribes and the health check writes no status. Every leader poll
//!   tries to take the lease.
//! - **Leader**: the lease is renewed every poll and a channel subscriber runs.
//!   A subscriber fault (dead channel, persistent overload) makes the collector
//!   concede: drop local leadership and delete the lease if it is still ours,
//!   so any instance, this one included, can take over on its next poll.
//!
//! A lease store failure ends `run` with an error that `start` treats as
//! fatal; any other unexpected stop is restarted under a fresh identity.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::dispatcher::BatchDispatcher;
use crate::core::health::HealthChecker;
use crate::core::intake::{IntakeQueue, PushReport};
use crate::core::leadership::{LeadershipLock, LeaseError};
use crate::core::reference_cache::ReferenceCache;
use crate::core::settings::CollectorSettings;
use crate::core::stats::PipelineStats;
use crate::core::subscriber::{ChannelSubscriber, SubscriberFault};
use crate::core::worker_pool::{MessageHandler, WorkerPool};
use crate::discovery::handler::DiscoveryHandler;
use crate::snapshot::handler::HostSnapHandler;
use crate::storage::{ChannelSource, HostStore, KvStore, ModelStore};
use crate::utils::identity::instance_id;

/// How long shutdown waits for running batches.
const DRAIN_LIMIT: Duration = Duration::from_secs(5);

/// Whether this instance currently consumes the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorRole {
    /// Holds the lease and subscribes.
    Leader,
    /// Waits for the lease.
    Follower,
}

/// Why a collector stopped.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The lease store failed; the process should exit.
    #[error(transparent)]
    Lease(#[from] LeaseError),
    /// A background task ended before shutdown.
    #[error("background task {0} stopped unexpectedly")]
    Task(String),
}

impl CollectorError {
    /// Fatal errors are not restarted by [`Collector::start`].
    pub fn is_fatal(&self) -> bool {
        matches!(self, CollectorError::Lease(_))
    }
}

/// What a collector consumes.
#[derive(Clone)]
pub enum Stream {
    /// Host snapshots, resolved through the reference cache.
    HostSnapshot,
    /// Model discovery, written through the model store.
    Discovery(Arc<dyn ModelStore>),
}

/// The external systems a collector talks to.
#[derive(Clone)]
pub struct CollectorDeps {
    /// Lease, raw snapshot copies, cached instances, channel status.
    pub kv: Arc<dyn KvStore>,
    /// The channel source.
    pub source: Arc<dyn ChannelSource>,
    /// The host registry.
    pub store: Arc<dyn HostStore>,
    /// Message kind and the store it needs.
    pub stream: Stream,
}

/// # Collector
pub struct Collector {
    settings: CollectorSettings,
    channels: Vec<String>,
    deps: CollectorDeps,
    lock: Arc<LeadershipLock>,
    intake: Arc<IntakeQueue>,
    cache: Arc<ReferenceCache>,
    pool: Arc<WorkerPool>,
    stats: Arc<PipelineStats>,
    role: RwLock<CollectorRole>,
    shutdown: CancellationToken,
}

impl Collector {
    /// Builds a follower-state collector for `deps.stream` on `channels`.
    pub fn new(
        settings: CollectorSettings,
        channels: Vec<String>,
        deps: CollectorDeps,
        identity: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let stats = Arc::new(PipelineStats::new());
        let cache = Arc::new(ReferenceCache::new(Arc::clone(&deps.store), settings.fetch_page_size));
        let handler: Arc<dyn MessageHandler> = match &deps.stream {
            Stream::HostSnapshot => Arc::new(HostSnapHandler::new(
                Arc::clone(&cache),
                Arc::clone(&deps.kv),
                Arc::clone(&deps.store),
                settings.snapshot_ttl,
            )),
            Stream::Discovery(models) => Arc::new(DiscoveryHandler::new(Arc::clone(&deps.kv), Arc::clone(models))),
        };
        let pool = Arc::new(WorkerPool::new(
            settings.effective_concurrency(),
            settings.submit_poll,
            handler,
            Arc::clone(&stats),
            shutdown.clone(),
        ));
        let lock = Arc::new(LeadershipLock::new(
            Arc::clone(&deps.kv),
            &settings.name,
            identity,
            settings.lease_ttl,
        ));
        Self {
            intake: Arc::new(IntakeQueue::new(settings.effective_batch_size())),
            settings,
            channels,
            deps,
            lock,
            cache,
            pool,
            stats,
            role: RwLock::new(CollectorRole::Follower),
            shutdown,
        }
    }

    /// # Start
    ///
    /// Runs collectors until `shutdown` fires. A collector that stops with a
    /// recoverable error is replaced, under a fresh identity, after
    /// `restart_delay`. Fatal errors are returned.
    pub async fn start(
        settings: CollectorSettings,
        channels: Vec<String>,
        deps: CollectorDeps,
        shutdown: CancellationToken,
    ) -> Result<(), CollectorError> {
        loop {
            let collector = Collector::new(
                settings.clone(),
                channels.clone(),
                deps.clone(),
                instance_id(),
                shutdown.clone(),
            );
            match collector.run().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(error = %e, "collector stopped, restarting in {:?}", settings.restart_delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(settings.restart_delay) => {}
                    }
                }
            }
        }
    }

    /// This instance's lease identity.
    pub fn identity(&self) -> &str {
        self.lock.identity()
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// The reference cache.
    pub fn cache(&self) -> &Arc<ReferenceCache> {
        &self.cache
    }

    /// The intake queue.
    pub fn intake(&self) -> &Arc<IntakeQueue> {
        &self.intake
    }

    /// Current role.
    pub async fn role(&self) -> CollectorRole {
        *self.role.read().await
    }

    /// Pushes a payload straight onto the intake queue, bypassing the channel.
    pub fn mock(&self, payload: impl Into<String>) -> PushReport {
        self.stats.record_received();
        let report = self.intake.push(payload.into());
        if report.evicted > 0 {
            self.stats.record_evicted(report.evicted);
        }
        report
    }

    /// # Run
    ///
    /// ## Logic:
    /// 1. Warm the reference cache (a failure leaves it to the refresh loop).
    ///    Discovery collectors have no host cache and skip it.
    /// 2. Spawn the cache refresh, dispatcher and health check.
    /// 3. Poll the lease; start a subscriber whenever leader without one.
    /// 4. On shutdown or a fatal error, release the lease and drain the pool.
    pub async fn run(&self) -> Result<(), CollectorError> {
        info!(
            collector = %self.settings.name,
            identity = %self.identity(),
            channels = ?self.channels,
            maxconcurrent = self.pool.ceiling(),
            "collector starting"
        );

        // --- Phase 1: Warm the cache ---
        if self.uses_host_cache() {
            match self.cache.rebuild().await {
                Ok(size) => info!(size, "reference cache loaded"),
                Err(e) => error!(error = %e, "initial reference cache load failed"),
            }
        }

        // --- Phase 2: Background tasks ---
        let tasks = self.shutdown.child_token();
        let _stop_tasks = tasks.clone().drop_guard();
        let mut background = self.spawn_background(&tasks);

        // --- Phase 3: Leader loop ---
        let (fault_tx, mut fault_rx) = mpsc::channel::<SubscriberFault>(4);
        let mut subscriber: Option<JoinHandle<()>> = None;
        let mut ticker = tokio::time::interval(self.settings.leader_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    let leader = match self.lock.try_acquire_or_renew().await {
                        Ok(leader) => leader,
                        Err(e) => {
                            error!(error = %e, "leadership check failed");
                            break Err(e.into());
                        }
                    };
                    self.transition(if leader { CollectorRole::Leader } else { CollectorRole::Follower }).await;
                    let running = subscriber.as_ref().is_some_and(|h| !h.is_finished());
                    if leader && !running {
                        let sub = self.subscriber();
                        let faults = fault_tx.clone();
                        let token = tasks.clone();
                        subscriber = Some(tokio::spawn(async move { sub.run(faults, token).await }));
                    }
                }
                Some(fault) = fault_rx.recv() => {
                    warn!(?fault, "subscription interrupted");
                    self.concede().await;
                }
                Some(joined) = background.join_next() => {
                    if self.shutdown.is_cancelled() {
                        break Ok(());
                    }
                    let name = match joined {
                        Ok(name) => name.to_string(),
                        Err(e) => e.to_string(),
                    };
                    break Err(CollectorError::Task(name));
                }
            }
        };

        // --- Phase 4: Wind down ---
        tasks.cancel();
        if self.lock.is_leader() {
            self.concede().await;
        }
        if let Some(handle) = subscriber {
            let _ = handle.await;
        }
        while background.join_next().await.is_some() {}
        self.pool.close(DRAIN_LIMIT).await;
        info!(stats = ?self.stats.snapshot(), "collector stopped");
        result
    }

    fn uses_host_cache(&self) -> bool {
        matches!(self.deps.stream, Stream::HostSnapshot)
    }

    fn spawn_background(&self, tasks: &CancellationToken) -> JoinSet<&'static str> {
        let mut set = JoinSet::new();

        if self.uses_host_cache() {
            let cache = Arc::clone(&self.cache);
            let (interval, token) = (self.settings.cache_refresh, tasks.clone());
            set.spawn(async move {
                cache.run_refresh(interval, token).await;
                "cache refresh"
            });
        }

        let dispatcher = BatchDispatcher::new(
            Arc::clone(&self.intake),
            Arc::clone(&self.pool),
            Arc::clone(&self.stats),
            self.settings.effective_batch_size(),
            self.settings.batch_window,
        );
        let token = tasks.clone();
        set.spawn(async move {
            dispatcher.run(token).await;
            "dispatcher"
        });

        let health = HealthChecker::new(
            &self.settings.name,
            Arc::clone(&self.deps.source),
            Arc::clone(&self.deps.kv),
            Arc::clone(&self.lock),
            Arc::clone(&self.stats),
        );
        let (interval, token) = (self.settings.health_check, tasks.clone());
        set.spawn(async move {
            health.run(interval, token).await;
            "health check"
        });

        set
    }

    fn subscriber(&self) -> ChannelSubscriber {
        ChannelSubscriber::new(
            Arc::clone(&self.deps.source),
            self.channels.clone(),
            Arc::clone(&self.lock),
            Arc::clone(&self.intake),
            self.pool.reset_signal(),
            Arc::clone(&self.stats),
            self.settings.receive_timeout,
            self.settings.overload_relinquish_after,
        )
    }

    /// Gives up leadership; the next poll competes for the lease again.
    async fn concede(&self) {
        if let Err(e) = self.lock.relinquish().await {
            warn!(error = %e, "failed to release lease, it will expire on its own");
        }
        self.transition(CollectorRole::Follower).await;
    }

    async fn transition(&self, next: CollectorRole) {
        let mut role = self.role.write().await;
        if *role != next {
            info!("Transitioning mode: {:?} -> {:?}", *role, next);
            *role = next;
        }
    }
}
