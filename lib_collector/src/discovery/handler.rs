//! # Discovery Handler
//!
//! The per-message unit of work for the discovery channel:
//! decode, build the unique condition, resolve through the KV cache and the
//! model store, then create the instance or write back the full record when
//! any reported attribute changed.
//!
//! ## Logic:
//! - The model must have exactly one must-check unique rule; its attribute
//!   values identify the instance and name the cache key.
//! - A message with an empty unique value is skipped.
//! - The `host` relation attribute is only written while the stored relation
//!   is unbound; an instance already tied to a host keeps its host.
//! - A successful update evicts the cached copy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::worker_pool::{HandleError, HandleOutcome, MessageHandler};
use crate::discovery::message::DiscoveryMessage;
use crate::snapshot::decoder::value_to_string;
use crate::snapshot::field_map::{as_i64, values_equal};
use crate::storage::{FieldMap, KvStore, ModelStore, StoreError, FIELD_INST_ID, FIELD_OBJ_ID, FIELD_OWNER_ID};

/// How long a resolved instance stays in the KV cache.
pub const INST_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Account the collector acts as; part of every cache key.
pub const COLLECTOR_USER: &str = "cc_collector";
/// Relation attribute tying an instance to its host.
pub const RELATION_ATTR: &str = "host";

/// Fields maintained by the store, never written back.
const SYSTEM_FIELDS: [&str; 6] = [FIELD_OBJ_ID, FIELD_OWNER_ID, "default", FIELD_INST_ID, "last_time", "create_time"];

/// Cache key of an instance: `cc:v3:inst[<user>:<owner>:<model>:<unique values>]`.
pub fn inst_key(owner_id: &str, obj_id: &str, values: &[String]) -> String {
    format!("cc:v3:inst[{COLLECTOR_USER}:{owner_id}:{obj_id}:{}]", values.join(":"))
}

/// State of a stored single-host relation.
enum Relation {
    /// Tied to a host; the stored value wins.
    Bound,
    /// One relation entry without a host id.
    Unbound,
    /// Anything other than a one-entry list.
    Unreadable,
}

fn relation(stored: Option<&Value>) -> Relation {
    match stored {
        Some(Value::Array(list)) if list.len() == 1 => {
            let id = list[0].get("id").map(value_to_string).unwrap_or_default();
            if id.is_empty() || id == "0" {
                Relation::Unbound
            } else {
                Relation::Bound
            }
        }
        _ => Relation::Unreadable,
    }
}

/// Creates or updates discovered model instances.
pub struct DiscoveryHandler {
    kv: Arc<dyn KvStore>,
    models: Arc<dyn ModelStore>,
    cache_ttl: Duration,
}

impl DiscoveryHandler {
    /// Creates a handler caching resolved instances for [`INST_CACHE_TTL`].
    pub fn new(kv: Arc<dyn KvStore>, models: Arc<dyn ModelStore>) -> Self {
        Self { kv, models, cache_ttl: INST_CACHE_TTL }
    }

    /// Attribute ids of the model's single must-check unique rule.
    async fn unique_keys(&self, msg: &DiscoveryMessage) -> Result<Vec<String>, StoreError> {
        let mut uniques = self.models.must_check_uniques(msg.obj_id(), msg.owner_id()).await?;
        match uniques.len() {
            1 => {
                let keys = uniques.remove(0);
                if keys.is_empty() {
                    return Err(StoreError::InvalidData(format!("model {} has an empty unique rule", msg.obj_id())));
                }
                Ok(keys)
            }
            n => Err(StoreError::InvalidData(format!(
                "model {} has {n} must check uniques, expected 1",
                msg.obj_id()
            ))),
        }
    }

    async fn cached(&self, key: &str) -> Option<FieldMap> {
        let text = match self.kv.get(key).await {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "instance cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(inst) => Some(inst),
            Err(e) => {
                warn!(key, error = %e, "unreadable cached instance");
                None
            }
        }
    }

    /// KV cache first, then the model store; a store hit is cached.
    async fn instance(&self, obj_id: &str, key: &str, cond: &FieldMap) -> Result<Option<FieldMap>, StoreError> {
        if let Some(inst) = self.cached(key).await {
            debug!(key, "instance found in cache");
            return Ok(Some(inst));
        }
        let found = self.models.find_instance(obj_id, cond).await?;
        if let Some(inst) = &found {
            match serde_json::to_string(inst) {
                Ok(text) => {
                    if let Err(e) = self.kv.set_ex(key, &text, self.cache_ttl).await {
                        warn!(key, error = %e, "failed to cache instance");
                    }
                }
                Err(e) => warn!(key, error = %e, "failed to encode instance"),
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl MessageHandler for DiscoveryHandler {
    async fn handle(&self, raw: &str) -> Result<HandleOutcome, HandleError> {
        // --- Phase 1: Decode ---
        let msg = DiscoveryMessage::decode(raw)?;
        if msg.obj_id().is_empty() {
            warn!("discovery message names no model");
            return Ok(HandleOutcome::Skipped("no model"));
        }
        let (obj_id, owner_id) = (msg.obj_id().to_string(), msg.owner_id().to_string());

        // --- Phase 2: Unique condition ---
        let keys = self.unique_keys(&msg).await?;
        let mut cond = FieldMap::new();
        cond.insert(FIELD_OWNER_ID.to_string(), Value::from(owner_id.as_str()));
        let mut values = Vec::with_capacity(keys.len());
        for key in &keys {
            let value = msg.body().get(key).cloned().unwrap_or(Value::Null);
            let text = value_to_string(&value);
            if text.is_empty() {
                warn!(%obj_id, %key, "skip instance because of empty unique key value");
                return Ok(HandleOutcome::Skipped("empty unique key"));
            }
            values.push(text);
            cond.insert(key.clone(), value);
        }
        let key = inst_key(&owner_id, &obj_id, &values);

        // --- Phase 3: Resolve or create ---
        let Some(mut inst) = self.instance(&obj_id, &key, &cond).await? else {
            let mut data = msg.into_body();
            data.entry(FIELD_OWNER_ID.to_string())
                .or_insert_with(|| Value::from(owner_id.as_str()));
            let id = self.models.create_instance(&obj_id, &data).await?;
            info!(%obj_id, id, "instance created");
            return Ok(HandleOutcome::Created { id });
        };
        let inst_id = inst
            .get(FIELD_INST_ID)
            .map(as_i64)
            .filter(|id| *id > 0)
            .ok_or_else(|| StoreError::InvalidData(format!("{key}: stored instance has no {FIELD_INST_ID}")))?;

        // --- Phase 4: Diff ---
        let mut changed = 0;
        for (attr, value) in msg.body() {
            if attr == RELATION_ATTR {
                match relation(inst.get(RELATION_ATTR)) {
                    Relation::Bound => debug!(inst_id, "skip update of bound relation"),
                    Relation::Unbound if value.as_str() != Some("") => {
                        inst.insert(attr.clone(), value.clone());
                        changed += 1;
                    }
                    Relation::Unbound => {}
                    Relation::Unreadable => warn!(inst_id, "unreadable relation data, skip update"),
                }
                continue;
            }
            if !inst.get(attr).is_some_and(|stored| values_equal(value, stored)) {
                debug!(inst_id, %attr, "attribute changed");
                inst.insert(attr.clone(), value.clone());
                changed += 1;
            }
        }
        if changed == 0 {
            debug!(inst_id, "no need to update inst");
            return Ok(HandleOutcome::Unchanged { id: inst_id });
        }

        // --- Phase 5: Write and evict ---
        for field in SYSTEM_FIELDS {
            inst.remove(field);
        }
        self.models.update_instance(&obj_id, inst_id, &inst).await?;
        if let Err(e) = self.kv.delete(&key).await {
            warn!(%key, error = %e, "failed to evict cached instance");
        }
        Ok(HandleOutcome::Updated { id: inst_id, changed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::{MemoryKvStore, MemoryModelStore};
    use serde_json::json;

    const KEYS: [&str; 3] = ["ip_addr", "bk_inst_name", "port_num"];

    fn setup() -> (DiscoveryHandler, Arc<MemoryModelStore>, Arc<MemoryKvStore>) {
        let models = Arc::new(MemoryModelStore::new());
        models.add_unique("mysql", &KEYS);
        let kv = Arc::new(MemoryKvStore::new());
        (DiscoveryHandler::new(kv.clone(), models.clone()), models, kv)
    }

    fn mysql() -> Value {
        json!({
            "ip_addr": "10.0.1.234",
            "bk_inst_name": "mysql-1",
            "port_num": "3306",
            "db_size": "77.81MB",
            "storage_engine": "InnoDB"
        })
    }

    fn payload(obj_id: &str, body: &Value) -> String {
        json!({
            "bizid": 0,
            "cloudid": 0,
            "type": "bkdiscover",
            "data": {
                "data": body,
                "meta": { "model": { "bk_obj_id": obj_id, "keys": KEYS.join(",") } }
            }
        })
        .to_string()
    }

    fn mysql_key() -> String {
        inst_key("0", "mysql", &["10.0.1.234".into(), "mysql-1".into(), "3306".into()])
    }

    fn fields(body: &Value) -> FieldMap {
        body.as_object().unwrap().clone().into_iter().collect()
    }

    #[test]
    fn key_joins_unique_values() {
        assert_eq!(mysql_key(), "cc:v3:inst[cc_collector:0:mysql:10.0.1.234:mysql-1:3306]");
    }

    #[tokio::test]
    async fn missing_instance_is_created() {
        let (handler, models, _) = setup();
        let outcome = handler.handle(&payload("mysql", &mysql())).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Created { id: 1 });
        let stored = models.instance(1).unwrap();
        assert_eq!(stored[FIELD_OWNER_ID], json!("0"));
        assert_eq!(stored["db_size"], json!("77.81MB"));
    }

    #[tokio::test]
    async fn store_hit_is_cached_and_unchanged_instance_is_not_written() {
        let (handler, models, kv) = setup();
        handler.handle(&payload("mysql", &mysql())).await.unwrap();
        assert_eq!(models.find_count(), 1);

        let outcome = handler.handle(&payload("mysql", &mysql())).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Unchanged { id: 1 });
        assert_eq!(models.find_count(), 2);
        assert!(kv.get(&mysql_key()).await.unwrap().is_some());
        assert!(kv.ttl(&mysql_key()).is_some_and(|ttl| ttl <= INST_CACHE_TTL));

        handler.handle(&payload("mysql", &mysql())).await.unwrap();
        assert_eq!(models.find_count(), 2);
        assert_eq!(models.update_count(), 0);
    }

    #[tokio::test]
    async fn cached_instance_skips_the_store() {
        let (handler, models, kv) = setup();
        let mut cached = fields(&mysql());
        cached.insert(FIELD_INST_ID.into(), json!(9));
        kv.set_ex(&mysql_key(), &serde_json::to_string(&cached).unwrap(), INST_CACHE_TTL)
            .await
            .unwrap();

        let outcome = handler.handle(&payload("mysql", &mysql())).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Unchanged { id: 9 });
        assert_eq!(models.find_count(), 0);
        assert_eq!(models.create_count(), 0);
    }

    #[tokio::test]
    async fn changed_attribute_updates_and_evicts() {
        let (handler, models, kv) = setup();
        handler.handle(&payload("mysql", &mysql())).await.unwrap();
        handler.handle(&payload("mysql", &mysql())).await.unwrap();
        assert!(kv.get(&mysql_key()).await.unwrap().is_some());

        let mut grown = mysql();
        grown["db_size"] = json!("80.02MB");
        let outcome = handler.handle(&payload("mysql", &grown)).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Updated { id: 1, changed: 1 });
        assert_eq!(models.instance(1).unwrap()["db_size"], json!("80.02MB"));
        assert_eq!(kv.get(&mysql_key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_unique_value_is_skipped() {
        let (handler, models, _) = setup();
        let mut body = mysql();
        body["port_num"] = json!("");
        let outcome = handler.handle(&payload("mysql", &body)).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Skipped("empty unique key"));

        body.as_object_mut().unwrap().remove("port_num");
        let outcome = handler.handle(&payload("mysql", &body)).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Skipped("empty unique key"));
        assert_eq!(models.find_count(), 0);
        assert_eq!(models.create_count(), 0);
    }

    #[tokio::test]
    async fn bound_host_relation_is_kept() {
        let (handler, models, _) = setup();
        let mut stored = fields(&mysql());
        stored.insert(FIELD_OWNER_ID.into(), json!("0"));
        stored.insert(RELATION_ATTR.into(), json!([{ "id": "12" }]));
        let id = models.create_instance("mysql", &stored).await.unwrap();

        let mut body = mysql();
        body[RELATION_ATTR] = json!("10.0.1.234");
        let outcome = handler.handle(&payload("mysql", &body)).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Unchanged { id });
        assert_eq!(models.update_count(), 0);
    }

    #[tokio::test]
    async fn unbound_host_relation_is_filled() {
        let (handler, models, _) = setup();
        let mut stored = fields(&mysql());
        stored.insert(FIELD_OWNER_ID.into(), json!("0"));
        stored.insert(RELATION_ATTR.into(), json!([{ "id": "" }]));
        let id = models.create_instance("mysql", &stored).await.unwrap();

        let mut body = mysql();
        body[RELATION_ATTR] = json!("10.0.1.234");
        let outcome = handler.handle(&payload("mysql", &body)).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Updated { id, changed: 1 });
        let updated = models.instance(id).unwrap();
        assert_eq!(updated[RELATION_ATTR], json!("10.0.1.234"));
        assert_eq!(updated[FIELD_INST_ID], json!(id));
    }

    #[tokio::test]
    async fn model_without_unique_rule_fails() {
        let (handler, models, _) = setup();
        let err = handler.handle(&payload("redis", &mysql())).await.unwrap_err();
        assert!(matches!(err, HandleError::Store(StoreError::InvalidData(_))));
        assert_eq!(models.create_count(), 0);

        let outcome = handler.handle(&payload("", &mysql())).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Skipped("no model"));
    }
}
