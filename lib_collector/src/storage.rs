//! # Storage Seams
//!
//! The external systems the pipeline talks to, expressed as narrow
//! async traits so the engine can run against Redis/PostgreSQL in production
//! and against the in-memory adapters in tests.
//!
//! ## Core Design Principles:
//! - **Narrow Surface**: only the operations the pipeline performs are exposed.
//! - **Typed Failures**: every adapter maps its driver errors into [`StoreError`]
//!   or [`ChannelError`]; nothing driver-specific leaks past this module.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Attribute name to value, ordered so diffs and log lines are stable.
pub type FieldMap = BTreeMap<String, Value>;

/// Host identifier column.
pub const FIELD_HOST_ID: &str = "bk_host_id";
/// Cloud (network partition) identifier column.
pub const FIELD_CLOUD_ID: &str = "bk_cloud_id";
/// Inner IP column.
pub const FIELD_INNER_IP: &str = "bk_host_innerip";
/// Outer IP column.
pub const FIELD_OUTER_IP: &str = "bk_host_outerip";
/// Owner / supplier account attribute.
pub const FIELD_OWNER_ID: &str = "bk_supplier_account";
/// Model (object type) of a discovered instance.
pub const FIELD_OBJ_ID: &str = "bk_obj_id";
/// Model instance identifier.
pub const FIELD_INST_ID: &str = "bk_inst_id";

/// Errors raised by the key-value and host stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing service could not be reached.
    #[error("store connection failed: {0}")]
    Connection(String),
    /// The service answered with an error.
    #[error("store query failed: {0}")]
    Query(String),
    /// An update targeted a host or instance id that does not exist.
    #[error("record {0} not found")]
    NotFound(i64),
    /// A stored row could not be interpreted.
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

/// Errors raised while receiving from the pub/sub channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Timeouts and nil replies; the subscriber keeps reading.
    #[error("transient channel error: {0}")]
    Transient(String),
    /// The subscription stream ended; the subscriber resubscribes once.
    #[error("channel subscription closed")]
    Closed,
    /// Anything else; the subscriber gives up leadership.
    #[error("channel failure: {0}")]
    Fatal(String),
}

/// Shared key-value store used for the leadership lease, snapshot copies,
/// cached model instances and channel status reports.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads a key; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Unconditionally writes a key with an expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    /// Writes a key with an expiry only if it is absent. Returns whether the write happened.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;
    /// Atomically extends the expiry of `key` if it still holds `expected`.
    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StoreError>;
    /// Atomically deletes `key` if it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
    /// Deletes `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    /// Liveness check.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// A live subscription to one or more channels.
#[async_trait]
pub trait Subscription: Send {
    /// Waits up to `timeout` for the next payload.
    async fn next_message(&mut self, timeout: Duration) -> Result<String, ChannelError>;
    /// Releases the subscription.
    async fn unsubscribe(self: Box<Self>) -> Result<(), ChannelError>;
}

/// A pub/sub service that snapshots arrive on.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Opens a subscription to `channels`.
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, ChannelError>;
    /// Liveness check.
    async fn ping(&self) -> Result<(), ChannelError>;
}

/// Conjunctive host query; `None` fields are not constrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFilter {
    /// Exact cloud id.
    pub cloud_id: Option<i64>,
    /// Inner IP must be one of these.
    pub inner_ips: Option<Vec<String>>,
    /// Owner / supplier account must equal this.
    pub owner_id: Option<String>,
}

/// Offset pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Number of records to skip.
    pub start: u64,
    /// Maximum records to return.
    pub limit: u64,
}

/// One host row as the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Host id, the update target.
    pub bk_host_id: i64,
    /// Cloud id.
    pub bk_cloud_id: i64,
    /// Primary inner IP.
    pub bk_host_innerip: String,
    /// Outer IP, empty when unset.
    #[serde(default)]
    pub bk_host_outerip: String,
    /// Every other attribute.
    #[serde(flatten)]
    pub attributes: FieldMap,
}

impl HostRecord {
    /// Builds a record with no extra attributes.
    pub fn new(host_id: i64, cloud_id: i64, inner_ip: impl Into<String>) -> Self {
        Self {
            bk_host_id: host_id,
            bk_cloud_id: cloud_id,
            bk_host_innerip: inner_ip.into(),
            bk_host_outerip: String::new(),
            attributes: FieldMap::new(),
        }
    }

    /// Owner id as a string, whether stored as text or number.
    pub fn owner_id(&self) -> Option<String> {
        match self.attributes.get(FIELD_OWNER_ID)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Whether this record satisfies `filter`.
    pub fn matches(&self, filter: &HostFilter) -> bool {
        if filter.cloud_id.is_some_and(|id| id != self.bk_cloud_id) {
            return false;
        }
        if let Some(ips) = &filter.inner_ips {
            if !ips.iter().any(|ip| *ip == self.bk_host_innerip) {
                return false;
            }
        }
        if let Some(owner) = &filter.owner_id {
            if self.owner_id().as_deref() != Some(owner.as_str()) {
                return false;
            }
        }
        true
    }

    /// Keeps only the listed attributes; an empty projection keeps everything.
    pub fn project(mut self, fields: &[&str]) -> Self {
        if !fields.is_empty() {
            self.attributes.retain(|k, _| fields.contains(&k.as_str()));
        }
        self
    }
}

/// The host registry.
#[async_trait]
pub trait HostStore: Send + Sync {
    /// Returns the hosts matching `filter`, projected to `fields`.
    async fn query_hosts(
        &self,
        filter: &HostFilter,
        fields: &[&str],
        page: Option<Page>,
    ) -> Result<Vec<HostRecord>, StoreError>;
    /// Merges `fields` into the attributes of `host_id`.
    async fn update_host(&self, host_id: i64, fields: &FieldMap) -> Result<(), StoreError>;
    /// Id of the default application, used to derive the channel name.
    async fn default_app_id(&self) -> Result<Option<i64>, StoreError>;
}

/// Model instances reported by discovery agents.
///
/// Instances are documents of attribute values; `bk_inst_id` is assigned by
/// the store on create and addresses the instance afterwards.
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Attribute ids of each must-check unique rule of `obj_id`.
    async fn must_check_uniques(&self, obj_id: &str, owner_id: &str) -> Result<Vec<Vec<String>>, StoreError>;
    /// First instance of `obj_id` whose attributes equal every entry of `cond`.
    async fn find_instance(&self, obj_id: &str, cond: &FieldMap) -> Result<Option<FieldMap>, StoreError>;
    /// Stores a new instance and returns its id.
    async fn create_instance(&self, obj_id: &str, data: &FieldMap) -> Result<i64, StoreError>;
    /// Merges `data` into instance `inst_id`.
    async fn update_instance(&self, obj_id: &str, inst_id: i64, data: &FieldMap) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> HostRecord {
        let mut r = HostRecord::new(7, 0, "192.168.1.7");
        r.attributes.insert(FIELD_OWNER_ID.into(), json!("0"));
        r.attributes.insert("bk_cpu".into(), json!(4));
        r
    }

    #[test]
    fn filter_is_conjunctive() {
        let r = record();
        assert!(r.matches(&HostFilter::default()));
        assert!(r.matches(&HostFilter {
            cloud_id: Some(0),
            inner_ips: Some(vec!["10.0.0.1".into(), "192.168.1.7".into()]),
            owner_id: Some("0".into()),
        }));
        assert!(!r.matches(&HostFilter { cloud_id: Some(1), ..Default::default() }));
        assert!(!r.matches(&HostFilter { owner_id: Some("3".into()), ..Default::default() }));
    }

    #[test]
    fn record_flattens_attributes() {
        let v = serde_json::to_value(record()).unwrap();
        assert_eq!(v["bk_cpu"], json!(4));
        assert_eq!(v["bk_host_id"], json!(7));
        let back: HostRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back.project(&["bk_cpu"]).attributes.len(), 1);
    }
}
