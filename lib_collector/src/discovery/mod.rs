//! # Discovery Module
//!
//! Model discovery messages: an external agent reports one instance of a
//! model (a MySQL server, a Redis node) per message. The handler looks the
//! instance up by the model's unique attributes, through a short-lived KV
//! cache, and creates it or writes back what changed.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Resolve, diff and create-or-update for one discovery message.
pub mod handler;
/// Discovery payload decoding.
pub mod message;

pub use handler::{inst_key, DiscoveryHandler};
pub use message::DiscoveryMessage;
