//! # Snapshot Envelope Decoder
//!
//! Agents publish either the snapshot body itself (recognisable by a top-level
//! `cloudid`) or a wrapper whose `data` field carries the body as an escaped
//! JSON string. [`Snapshot::decode`] accepts both and exposes the few routing
//! fields the pipeline needs before attribute extraction.

use std::net::IpAddr;

use serde_json::Value;
use thiserror::Error;

/// Reasons a raw payload cannot be turned into a [`Snapshot`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload (or the wrapped body) is not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// No message body was found.
    #[error("payload carries no message body")]
    MissingBody,
    /// The body decoded to something other than a JSON object.
    #[error("message body is not a JSON object")]
    NotAnObject,
}

/// A decoded host snapshot body.
#[derive(Debug, Clone)]
pub struct Snapshot {
    body: Value,
    raw_body: String,
}

impl Snapshot {
    /// # Decode
    ///
    /// ## Logic:
    /// 1. Parse the outer payload.
    /// 2. A top-level `cloudid` means the payload *is* the body.
    /// 3. Otherwise `data` holds the body, as an escaped string or inline object.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let outer: Value = serde_json::from_str(raw)?;
        if outer.get("cloudid").is_some() {
            return Self::from_body(outer, raw.to_string());
        }
        match outer.get("data") {
            Some(Value::String(inner)) => {
                let body: Value = serde_json::from_str(inner)?;
                Self::from_body(body, inner.clone())
            }
            Some(obj @ Value::Object(_)) => Self::from_body(obj.clone(), obj.to_string()),
            _ => Err(DecodeError::MissingBody),
        }
    }

    fn from_body(body: Value, raw_body: String) -> Result<Self, DecodeError> {
        if !body.is_object() {
            return Err(DecodeError::NotAnObject);
        }
        Ok(Self { body, raw_body })
    }

    /// The decoded body.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// The body as text, which is what gets cached under the snapshot key.
    pub fn raw_body(&self) -> &str {
        &self.raw_body
    }

    /// Cloud id rendered as a string; empty when absent.
    pub fn cloud_id(&self) -> String {
        self.body.get("cloudid").map(value_to_string).unwrap_or_default()
    }

    /// Owner scope of the reporting agent (`bizid`), when present.
    pub fn owner_id(&self) -> Option<String> {
        self.body
            .get("bizid")
            .map(value_to_string)
            .filter(|s| !s.is_empty())
    }

    /// Agent-side timestamp, for logging only.
    pub fn timestamp(&self) -> Option<String> {
        self.body.get("timestamp").map(value_to_string)
    }

    /// # Candidate IPs
    ///
    /// The top-level `ip` first, then every interface address with its prefix
    /// length stripped. Loopback and empty entries are skipped, duplicates
    /// keep their first position.
    pub fn candidate_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = Vec::new();
        let mut push = |ip: &str| {
            if !ip.is_empty() && !is_loopback(ip) && !ips.iter().any(|known| known == ip) {
                ips.push(ip.to_string());
            }
        };

        if let Some(ip) = self.body.get("ip") {
            push(&value_to_string(ip));
        }
        for iface in interfaces(&self.body) {
            for addr in interface_addrs(iface) {
                push(&addr);
            }
        }
        ips
    }
}

/// Wraps a snapshot body the way agents publish it: `{"data": "<escaped body>"}`.
pub fn encode_envelope(body: &Value) -> String {
    serde_json::json!({ "data": body.to_string() }).to_string()
}

/// `data.net.interface[]`, empty when absent.
pub(crate) fn interfaces(body: &Value) -> &[Value] {
    body.pointer("/data/net/interface")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Addresses of one interface with the `/prefix` suffix removed.
pub(crate) fn interface_addrs(iface: &Value) -> impl Iterator<Item = String> + '_ {
    iface
        .get("addrs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|a| a.get("addr"))
        .map(|a| {
            let addr = value_to_string(a);
            match addr.split_once('/') {
                Some((ip, _)) => ip.to_string(),
                None => addr,
            }
        })
}

fn is_loopback(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(addr) => addr.is_loopback(),
        Err(_) => ip.starts_with("127.0.0."),
    }
}

/// Scalar to string the way loosely typed agents expect: strings verbatim,
/// numbers and booleans printed, anything else empty.
pub(crate) fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}
