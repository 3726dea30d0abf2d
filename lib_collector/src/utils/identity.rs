//! # Instance Identity
//!
//! Every collector instance competes for the lease under a unique identity.
//! The identity is readable in the KV store, so it names the host and process
//! that holds the lease, plus a random suffix that changes on every restart.

use uuid::Uuid;

/// Returns `<hostname>-<pid>-<8 hex chars>`.
pub fn instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &nonce[..8])
}
