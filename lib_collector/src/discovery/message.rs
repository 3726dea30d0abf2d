//! # Discovery Message
//!
//! `data.meta.model` names the model and, optionally, the owner account.
//! `data.data` carries the instance attributes, inline or as an escaped JSON
//! string. The outer `data` may itself arrive as an escaped string.

use serde_json::Value;

use crate::snapshot::decoder::{value_to_string, DecodeError};
use crate::storage::{FieldMap, FIELD_OBJ_ID, FIELD_OWNER_ID};

/// Owner account used when the message names none.
pub const DEFAULT_OWNER_ID: &str = "0";

/// A decoded discovery message.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMessage {
    obj_id: String,
    owner_id: String,
    body: FieldMap,
}

impl DiscoveryMessage {
    /// Decodes a raw channel payload.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let outer: Value = serde_json::from_str(raw)?;
        let data = match outer.get("data") {
            Some(Value::String(inner)) => serde_json::from_str(inner)?,
            Some(data) => data.clone(),
            None => return Err(DecodeError::MissingBody),
        };

        let model = data.pointer("/meta/model");
        let model_field = |name: &str| {
            model
                .and_then(|m| m.get(name))
                .map(value_to_string)
                .unwrap_or_default()
        };
        let obj_id = model_field(FIELD_OBJ_ID);
        let mut owner_id = model_field(FIELD_OWNER_ID);
        if owner_id.is_empty() {
            owner_id = DEFAULT_OWNER_ID.to_string();
        }

        let body = match data.get("data") {
            Some(Value::String(inner)) => serde_json::from_str(inner)?,
            Some(body) => body.clone(),
            None => return Err(DecodeError::MissingBody),
        };
        let Value::Object(body) = body else {
            return Err(DecodeError::NotAnObject);
        };
        Ok(Self { obj_id, owner_id, body: body.into_iter().collect() })
    }

    /// Model id; empty when the message names none.
    pub fn obj_id(&self) -> &str {
        &self.obj_id
    }

    /// Owner account.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Reported instance attributes.
    pub fn body(&self) -> &FieldMap {
        &self.body
    }

    /// Consumes the message, keeping the attributes.
    pub fn into_body(self) -> FieldMap {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_model_and_inline_body() {
        let raw = json!({
            "type": "bkdiscover",
            "data": {
                "data": { "ip_addr": "10.0.1.234", "port_num": "3306" },
                "meta": { "model": { "bk_obj_id": "mysql", "keys": "ip_addr,port_num" } }
            }
        })
        .to_string();
        let msg = DiscoveryMessage::decode(&raw).unwrap();
        assert_eq!(msg.obj_id(), "mysql");
        assert_eq!(msg.owner_id(), DEFAULT_OWNER_ID);
        assert_eq!(msg.body()["port_num"], json!("3306"));
    }

    #[test]
    fn accepts_escaped_layers() {
        let inner = json!({
            "data": json!({ "ip_addr": "10.0.1.9" }).to_string(),
            "meta": { "model": { "bk_obj_id": "redis", "bk_supplier_account": "7" } }
        });
        let raw = json!({ "data": inner.to_string() }).to_string();
        let msg = DiscoveryMessage::decode(&raw).unwrap();
        assert_eq!(msg.obj_id(), "redis");
        assert_eq!(msg.owner_id(), "7");
        assert_eq!(msg.into_body().len(), 1);
    }

    #[test]
    fn rejects_missing_or_scalar_body() {
        assert!(matches!(DiscoveryMessage::decode("{}"), Err(DecodeError::MissingBody)));
        let raw = json!({ "data": { "data": 3 } }).to_string();
        assert!(matches!(DiscoveryMessage::decode(&raw), Err(DecodeError::NotAnObject)));
    }
}
