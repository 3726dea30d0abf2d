//! # lib_collector
//!
//! Host snapshot collector engine. Agents publish periodic host snapshots on a
//! pub/sub channel; exactly one elected collector instance subscribes, batches
//! the raw payloads, resolves each one to a known host through a double-buffered
//! reference cache and writes back only the attributes that changed. The same
//! engine consumes model discovery channels, creating or updating the reported
//! model instances.

// Declare the modules to re-export
pub mod configs;
pub mod connections;
pub mod core;
pub mod discovery;
pub mod loggers;
pub mod snapshot;
pub mod storage;
pub mod utils;

// Re-export everything
pub use configs::config_collector::{load_config, CollectorConfig, ConfigError, ConfigOverrides, DiscoveryConfig};
pub use crate::core::collector::{Collector, CollectorDeps, CollectorError, Stream};
pub use crate::core::settings::CollectorSettings;
pub use loggers::setup::{setup_logging, LogOptions};
pub use storage::*;
