//! # Collector Configuration
//!
//! Every setting can come from three places, later ones winning:
//!
//! 1. Built-in defaults.
//! 2. A JSON file (`--config-path` / `COLLECTOR_CONFIG_PATH`, default `collector.conf`).
//! 3. Environment variables and command-line flags, parsed by `clap`.
//!
//! Connection settings are grouped into named profiles in the file
//! (`snap-redis`, `discover-redis`, `redis`, `mongodb`); the flat `*_URL`
//! flags override a profile's URL.
//!
//! A discovery collector runs next to the snapshot collector only when
//! discovery channels are configured.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::settings::CollectorSettings;

/// Profile the snapshot channel is read from.
pub const PROFILE_SNAP_REDIS: &str = "snap-redis";
/// Profile the discovery channels are read from.
pub const PROFILE_DISCOVER_REDIS: &str = "discover-redis";
/// Profile of the shared KV store.
pub const PROFILE_REDIS: &str = "redis";
/// Profile of the host registry.
pub const PROFILE_DOCUMENT_STORE: &str = "mongodb";

const DEFAULT_CONFIG_FILE: &str = "collector.conf";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid JSON for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// JSON failure.
        #[source]
        source: serde_json::Error,
    },
    /// A required connection profile has no URL.
    #[error("connection profile `{0}` has no url")]
    MissingProfile(&'static str),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One named connection.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    /// Connection URL.
    pub url: String,
    /// Pool size, where the adapter pools connections.
    #[serde(default)]
    pub pool_size: Option<usize>,
}

/// Raw, partially specified configuration; one layer of the merge.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Host snapshot collector", version)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverrides {
    #[clap(long, env = "COLLECTOR_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "COLLECTOR_NAME", help = "Collector name; namespaces the lease and status keys.")]
    pub collector_name: Option<String>,

    #[clap(long, env = "COLLECTOR_CHANNELS", value_delimiter = ',', help = "Channels to subscribe (default: <defaultAppID>_snapshot).")]
    pub channels: Option<Vec<String>>,

    #[clap(skip)]
    pub profiles: Option<BTreeMap<String, ConnectionProfile>>,

    #[clap(long, env = "SNAP_REDIS_URL", help = "URL of the Redis carrying the snapshot channel.")]
    pub snap_redis_url: Option<String>,

    #[clap(long, env = "COLLECTOR_DISCOVERY_NAME", help = "Name of the discovery collector; namespaces its lease and status keys.")]
    pub discovery_name: Option<String>,

    #[clap(long, env = "COLLECTOR_DISCOVERY_CHANNELS", value_delimiter = ',', help = "Discovery channels to subscribe; none disables discovery.")]
    pub discovery_channels: Option<Vec<String>>,

    #[clap(long, env = "DISCOVER_REDIS_URL", help = "URL of the Redis carrying the discovery channels.")]
    pub discover_redis_url: Option<String>,

    #[clap(long, env = "REDIS_URL", help = "URL of the shared Redis key-value store.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "DATABASE_URL", help = "URL of the host registry database.")]
    pub database_url: Option<String>,

    #[clap(long, env = "COLLECTOR_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "COLLECTOR_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "COLLECTOR_BATCH_SIZE", help = "Messages per batch; 0 selects 100.")]
    pub batch_size: Option<usize>,

    #[clap(long, env = "COLLECTOR_MAX_CONCURRENCY", help = "Concurrent batches (default: CPU cores).")]
    pub max_concurrency: Option<usize>,

    #[clap(long, env = "COLLECTOR_LEADER_POLL_SECS", help = "Seconds between leadership checks.")]
    pub leader_poll_secs: Option<u64>,

    #[clap(long, env = "COLLECTOR_LEASE_TTL_SECS", help = "Lease TTL in seconds (default: poll + 10).")]
    pub lease_ttl_secs: Option<u64>,

    #[clap(long, env = "COLLECTOR_CACHE_REFRESH_SECS", help = "Seconds between reference cache rebuilds.")]
    pub cache_refresh_secs: Option<u64>,

    #[clap(long, env = "COLLECTOR_SNAPSHOT_TTL_SECS", help = "TTL of the raw snapshot copy.")]
    pub snapshot_ttl_secs: Option<u64>,

    #[clap(long, env = "COLLECTOR_BATCH_WINDOW_MS", help = "Milliseconds a batch stays open.")]
    pub batch_window_ms: Option<u64>,

    #[clap(long, env = "COLLECTOR_RECEIVE_TIMEOUT_SECS", help = "Bound on one blocking channel read.")]
    pub receive_timeout_secs: Option<u64>,

    #[clap(long, env = "COLLECTOR_HEALTH_CHECK_SECS", help = "Seconds between channel status checks.")]
    pub health_check_secs: Option<u64>,

    #[clap(long, env = "COLLECTOR_FETCH_PAGE_SIZE", help = "Rows per page when rebuilding the cache.")]
    pub fetch_page_size: Option<u64>,

    #[clap(long, env = "COLLECTOR_OVERLOAD_RELINQUISH_AFTER", help = "Stalled evictions in a row before giving up leadership.")]
    pub overload_relinquish_after: Option<u32>,
}

impl ConfigOverrides {
    // Merge two layers, where 'other' overrides 'self' for Some values
    fn merge(self, other: ConfigOverrides) -> ConfigOverrides {
        let profiles = match (self.profiles, other.profiles) {
            (Some(mut base), Some(top)) => {
                base.extend(top);
                Some(base)
            }
            (base, top) => top.or(base),
        };
        ConfigOverrides {
            config_path: other.config_path.or(self.config_path),
            collector_name: other.collector_name.or(self.collector_name),
            channels: other.channels.or(self.channels),
            profiles,
            snap_redis_url: other.snap_redis_url.or(self.snap_redis_url),
            discovery_name: other.discovery_name.or(self.discovery_name),
            discovery_channels: other.discovery_channels.or(self.discovery_channels),
            discover_redis_url: other.discover_redis_url.or(self.discover_redis_url),
            redis_url: other.redis_url.or(self.redis_url),
            database_url: other.database_url.or(self.database_url),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            batch_size: other.batch_size.or(self.batch_size),
            max_concurrency: other.max_concurrency.or(self.max_concurrency),
            leader_poll_secs: other.leader_poll_secs.or(self.leader_poll_secs),
            lease_ttl_secs: other.lease_ttl_secs.or(self.lease_ttl_secs),
            cache_refresh_secs: other.cache_refresh_secs.or(self.cache_refresh_secs),
            snapshot_ttl_secs: other.snapshot_ttl_secs.or(self.snapshot_ttl_secs),
            batch_window_ms: other.batch_window_ms.or(self.batch_window_ms),
            receive_timeout_secs: other.receive_timeout_secs.or(self.receive_timeout_secs),
            health_check_secs: other.health_check_secs.or(self.health_check_secs),
            fetch_page_size: other.fetch_page_size.or(self.fetch_page_size),
            overload_relinquish_after: other.overload_relinquish_after.or(self.overload_relinquish_after),
        }
    }

    fn defaults() -> ConfigOverrides {
        let local_redis = ConnectionProfile { url: "redis://127.0.0.1:6379/".to_string(), pool_size: None };
        let profiles = BTreeMap::from([
            (PROFILE_SNAP_REDIS.to_string(), local_redis.clone()),
            (PROFILE_DISCOVER_REDIS.to_string(), local_redis.clone()),
            (PROFILE_REDIS.to_string(), local_redis),
            (
                PROFILE_DOCUMENT_STORE.to_string(),
                ConnectionProfile { url: "postgres://cc:cc@127.0.0.1:5432/cmdb".to_string(), pool_size: Some(16) },
            ),
        ]);
        ConfigOverrides {
            collector_name: Some("hostsnap".to_string()),
            discovery_name: Some("discover".to_string()),
            profiles: Some(profiles),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }
}

/// The optional discovery collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Collector name; namespaces its lease and status keys.
    pub name: String,
    /// Channels to subscribe.
    pub channels: Vec<String>,
    /// Source of the discovery channels.
    pub source: ConnectionProfile,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Pipeline tunables.
    pub settings: CollectorSettings,
    /// Explicit channels; `None` derives `<defaultAppID>_snapshot` at startup.
    pub channels: Option<Vec<String>>,
    /// Source of the snapshot channel.
    pub snap_redis: ConnectionProfile,
    /// Discovery collector, when discovery channels are configured.
    pub discovery: Option<DiscoveryConfig>,
    /// Shared KV store.
    pub redis: ConnectionProfile,
    /// Host registry.
    pub document_store: ConnectionProfile,
    /// Log directory.
    pub log_dir: PathBuf,
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,
}

/// Loads configuration from defaults, the config file and the process's
/// environment and arguments.
pub fn load_config() -> Result<CollectorConfig, ConfigError> {
    load_config_from(ConfigOverrides::parse())
}

/// # Load Config From
///
/// ## Logic:
/// 1. Start from built-in defaults.
/// 2. Merge the JSON file named by `cli` (or `collector.conf` when present).
/// 3. Merge `cli` itself on top and resolve.
pub fn load_config_from(cli: ConfigOverrides) -> Result<CollectorConfig, ConfigError> {
    let mut current = ConfigOverrides::defaults();

    let explicit = cli.config_path.clone();
    let path = explicit.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if path.exists() {
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        let file: ConfigOverrides =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
        info!("Loaded config file {}", path.display());
        current = current.merge(file);
    } else if explicit.is_some() {
        return Err(ConfigError::Read {
            path,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
        });
    } else {
        info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
    }

    resolve(current.merge(cli))
}

fn resolve(raw: ConfigOverrides) -> Result<CollectorConfig, ConfigError> {
    let base = CollectorSettings::default();
    let leader_poll = raw.leader_poll_secs.map_or(base.leader_poll, Duration::from_secs);
    let lease_ttl = raw
        .lease_ttl_secs
        .map_or(leader_poll + Duration::from_secs(10), Duration::from_secs);
    if leader_poll.is_zero() {
        return Err(ConfigError::Invalid("leaderPollSecs must be positive".into()));
    }
    if lease_ttl <= leader_poll {
        warn!(?lease_ttl, ?leader_poll, "lease ttl does not outlast the poll interval");
        return Err(ConfigError::Invalid("leaseTtlSecs must exceed leaderPollSecs".into()));
    }

    let settings = CollectorSettings {
        name: raw.collector_name.unwrap_or(base.name),
        batch_size: raw.batch_size.unwrap_or(base.batch_size),
        max_concurrency: raw.max_concurrency.unwrap_or(base.max_concurrency),
        leader_poll,
        lease_ttl,
        cache_refresh: raw.cache_refresh_secs.map_or(base.cache_refresh, Duration::from_secs),
        fetch_page_size: raw.fetch_page_size.unwrap_or(base.fetch_page_size),
        snapshot_ttl: raw.snapshot_ttl_secs.map_or(base.snapshot_ttl, Duration::from_secs),
        batch_window: raw.batch_window_ms.map_or(base.batch_window, Duration::from_millis),
        receive_timeout: raw.receive_timeout_secs.map_or(base.receive_timeout, Duration::from_secs),
        health_check: raw.health_check_secs.map_or(base.health_check, Duration::from_secs),
        overload_relinquish_after: raw.overload_relinquish_after.unwrap_or(base.overload_relinquish_after),
        ..base
    };

    let profiles = raw.profiles.unwrap_or_default();
    let profile = |name: &'static str, flat: Option<String>| -> Result<ConnectionProfile, ConfigError> {
        let mut p = profiles.get(name).cloned().unwrap_or_default();
        if let Some(url) = flat {
            p.url = url;
        }
        if p.url.trim().is_empty() {
            return Err(ConfigError::MissingProfile(name));
        }
        Ok(p)
    };

    let discovery = match raw.discovery_channels.filter(|c| !c.is_empty()) {
        Some(channels) => Some(DiscoveryConfig {
            name: raw.discovery_name.unwrap_or_else(|| "discover".to_string()),
            channels,
            source: profile(PROFILE_DISCOVER_REDIS, raw.discover_redis_url)?,
        }),
        None => None,
    };

    Ok(CollectorConfig {
        settings,
        channels: raw.channels.filter(|c| !c.is_empty()),
        snap_redis: profile(PROFILE_SNAP_REDIS, raw.snap_redis_url)?,
        discovery,
        redis: profile(PROFILE_REDIS, raw.redis_url)?,
        document_store: profile(PROFILE_DOCUMENT_STORE, raw.database_url)?,
        log_dir: raw.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
        log_level: raw.log_level.unwrap_or_else(|| "info".to_string()),
    })
}
