//! # Redis Adapters
//!
//! Async Redis implementations of the key-value store and the snapshot
//! channel. Commands go through a `ConnectionManager`, which reconnects on its
//! own; each subscription holds a dedicated pub/sub connection.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{Client, Msg, RedisError, Script};
use tracing::debug;

use crate::storage::{ChannelError, ChannelSource, KvStore, StoreError, Subscription};

const EXPIRE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("EXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

fn store_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Query(e.to_string())
    }
}

fn channel_error(e: RedisError) -> ChannelError {
    if e.is_timeout() {
        ChannelError::Transient(e.to_string())
    } else {
        ChannelError::Fatal(e.to_string())
    }
}

/// Whole seconds, at least one; Redis rejects a zero expiry.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// A Redis-backed [`KvStore`].
#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
    expire_if_equals: Script,
    delete_if_equals: Script,
}

impl RedisKvStore {
    /// Connects to the server at `url`.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(store_error)?;
        let conn = client.get_connection_manager().await.map_err(store_error)?;
        Ok(Self {
            conn,
            expire_if_equals: Script::new(EXPIRE_IF_EQUALS),
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
        })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(reply.is_some())
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .expire_if_equals
            .key(key)
            .arg(expected)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(extended == 1)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(deleted == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(store_error)?;
        Ok(())
    }
}

/// The snapshot channel on Redis pub/sub.
#[derive(Clone)]
pub struct RedisChannel {
    client: Client,
    conn: ConnectionManager,
}

impl RedisChannel {
    /// Connects to the server at `url`.
    pub async fn connect(url: &str) -> Result<Self, ChannelError> {
        let client = Client::open(url).map_err(channel_error)?;
        let conn = client.get_connection_manager().await.map_err(channel_error)?;
        Ok(Self { client, conn })
    }

    /// Publishes `payload` on `channel`; returns the number of receivers.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<i64, ChannelError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(channel_error)?;
        Ok(receivers)
    }
}

#[async_trait]
impl ChannelSource for RedisChannel {
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, ChannelError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(channel_error)?;
        for channel in channels {
            pubsub.subscribe(channel.as_str()).await.map_err(channel_error)?;
        }
        debug!(?channels, "redis subscription opened");
        Ok(Box::new(RedisSubscription { messages: Box::pin(pubsub.into_on_message()) }))
    }

    async fn ping(&self) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(channel_error)?;
        Ok(())
    }
}

/// An open Redis pub/sub subscription.
pub struct RedisSubscription {
    messages: Pin<Box<dyn Stream<Item = Msg> + Send>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        match tokio::time::timeout(timeout, self.messages.next()).await {
            Err(_) => Err(ChannelError::Transient("receive timeout".into())),
            Ok(None) => Err(ChannelError::Closed),
            Ok(Some(msg)) => msg
                .get_payload::<String>()
                .map_err(|e| ChannelError::Transient(format!("unreadable payload: {e}"))),
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), ChannelError> {
        // Dropping the stream closes the pub/sub connection, which ends every subscription on it.
        drop(self);
        Ok(())
    }
}
