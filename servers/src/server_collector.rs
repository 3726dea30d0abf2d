//! # Host Snapshot Collector Server
//!
//! Runs one collector instance against Redis and PostgreSQL. Any number of
//! instances may run side by side; the lease decides which one consumes the
//! snapshot channel. When discovery channels are configured, a discovery
//! collector runs alongside under its own lease.
//!
//! ## Lifecycle:
//! 1. Load `.env`, configuration and logging.
//! 2. Connect the KV store, the channels and the host registry.
//! 3. Resolve the channel name (`<defaultAppID>_snapshot` unless configured).
//! 4. Run the supervised collectors until a shutdown signal or a fatal error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lib_collector::connections::{PgHostStore, RedisChannel, RedisKvStore};
use lib_collector::{
    load_config, setup_logging, Collector, CollectorConfig, CollectorDeps, CollectorSettings, DiscoveryConfig,
    HostStore, LogOptions, Stream,
};
use tokio_graceful::{Shutdown, ShutdownGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pause between attempts to read the default application.
const CHANNEL_RETRY: Duration = Duration::from_secs(10);
/// Grace period after a shutdown signal.
const SHUTDOWN_LIMIT: Duration = Duration::from_secs(10);
/// Pool size when the profile does not set one.
const DEFAULT_POOL_SIZE: usize = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the environment and config file still apply.
    let _ = dotenvy::dotenv();

    let config = load_config().context("failed to load collector configuration")?;
    let _log_guard = setup_logging(&LogOptions::new(&config.log_dir, "server_collector", &config.log_level))
        .context("failed to initialise logging")?;
    info!(collector = %config.settings.name, "configuration loaded");

    let (deps, discovery) = connect(&config).await?;
    info!("connections established");

    let shutdown: Shutdown = Shutdown::default();
    let fatal = CancellationToken::new();
    if let Some((discovery_config, discovery_deps)) = discovery {
        let settings = CollectorSettings { name: discovery_config.name.clone(), ..config.settings.clone() };
        shutdown.spawn_task_fn({
            let fatal = fatal.clone();
            move |guard| supervise(guard, settings, discovery_config.channels, discovery_deps, fatal)
        });
    }
    shutdown.spawn_task_fn({
        let fatal = fatal.clone();
        move |guard| tokio_main(guard, config, deps, fatal)
    });

    tokio::select! {
        outcome = shutdown.shutdown_with_limit(SHUTDOWN_LIMIT) => match outcome {
            Ok(elapsed) => info!("shutdown: gracefully {}s after shutdown signal received", elapsed.as_secs_f64()),
            Err(e) => info!("shutdown: forcefully due to timeout: {}", e),
        },
        _ = fatal.cancelled() => {
            anyhow::bail!("collector stopped on a fatal error");
        }
    }

    info!("Bye!");
    Ok(())
}

type DiscoveryDeps = Option<(DiscoveryConfig, CollectorDeps)>;

/// Opens every adapter the collectors need.
async fn connect(config: &CollectorConfig) -> anyhow::Result<(CollectorDeps, DiscoveryDeps)> {
    let kv = RedisKvStore::connect(&config.redis.url)
        .await
        .context("failed to connect the redis kv store")?;
    let source = RedisChannel::connect(&config.snap_redis.url)
        .await
        .context("failed to connect the snapshot redis")?;

    let pool_size = config.document_store.pool_size.unwrap_or(DEFAULT_POOL_SIZE);
    let store = PgHostStore::connect(&config.document_store.url, pool_size)
        .context("failed to create the host store pool")?;
    store.ping().await.context("host store unreachable")?;
    let models = store.models();

    let deps = CollectorDeps {
        kv: Arc::new(kv),
        source: Arc::new(source),
        store: Arc::new(store),
        stream: Stream::HostSnapshot,
    };

    let discovery = match &config.discovery {
        Some(discovery) => {
            let source = RedisChannel::connect(&discovery.source.url)
                .await
                .context("failed to connect the discovery redis")?;
            let discovery_deps = CollectorDeps {
                source: Arc::new(source),
                stream: Stream::Discovery(Arc::new(models)),
                ..deps.clone()
            };
            Some((discovery.clone(), discovery_deps))
        }
        None => None,
    };
    Ok((deps, discovery))
}

/// # Asynchronous Main Logic
///
/// Resolves the channel and runs the collector until the shutdown guard fires.
/// A fatal collector error cancels `fatal`, which makes `main` exit non-zero.
async fn tokio_main(guard: ShutdownGuard, config: CollectorConfig, deps: CollectorDeps, fatal: CancellationToken) {
    let channels = match config.channels.clone() {
        Some(channels) => channels,
        None => match snapshot_channel(&guard, deps.store.as_ref()).await {
            Some(channel) => vec![channel],
            None => return,
        },
    };
    info!(?channels, "snapshot channel resolved");
    supervise(guard, config.settings, channels, deps, fatal).await;
}

/// Runs `Collector::start` until the shutdown guard fires; a fatal error
/// cancels `fatal`.
async fn supervise(
    guard: ShutdownGuard,
    settings: CollectorSettings,
    channels: Vec<String>,
    deps: CollectorDeps,
    fatal: CancellationToken,
) {
    let name = settings.name.clone();
    let token = CancellationToken::new();
    let collector = Collector::start(settings, channels, deps, token.clone());
    tokio::pin!(collector);

    let finished = tokio::select! {
        result = &mut collector => Some(result),
        _ = guard.cancelled() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            info!("Signal received: initiate graceful shutdown");
            token.cancel();
            collector.await
        }
    };
    if let Err(e) = result {
        error!(collector = %name, error = %e, "collector failed");
        fatal.cancel();
    }
}

/// Reads the default application id until it is known; `None` on shutdown.
async fn snapshot_channel(guard: &ShutdownGuard, store: &dyn HostStore) -> Option<String> {
    loop {
        match store.default_app_id().await {
            Ok(Some(app_id)) => return Some(format!("{app_id}_snapshot")),
            Ok(None) => warn!("default application not found, retrying in {:?}", CHANNEL_RETRY),
            Err(e) => warn!(error = %e, "failed to read default application, retrying in {:?}", CHANNEL_RETRY),
        }
        tokio::select! {
            _ = guard.cancelled() => return None,
            _ = tokio::time::sleep(CHANNEL_RETRY) => {}
        }
    }
}
