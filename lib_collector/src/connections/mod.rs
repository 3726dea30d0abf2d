//! # Connections Module
//!
//! Adapters behind the storage seams: Redis for the key-value store and the
//! pub/sub channels, PostgreSQL for the host registry and model instances, and
//! in-memory versions of each for tests and local runs.

/// Module for PostgreSQL host registry access through a connection pool.
#[cfg(feature = "connections")]
pub mod db_postgres;

/// Module for Redis key-value and pub/sub operations.
#[cfg(feature = "connections")]
pub mod cache_redis;

/// In-memory key-value store, pub/sub hub, host store and model store.
pub mod memory;

#[cfg(feature = "connections")]
pub use cache_redis::{RedisChannel, RedisKvStore};
#[cfg(feature = "connections")]
pub use db_postgres::{PgHostStore, PgModelStore};
pub use memory::{MemoryChannel, MemoryHostStore, MemoryKvStore, MemoryModelStore};
