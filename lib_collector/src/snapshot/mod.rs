//! # Snapshot Module
//!
//! Everything that understands the host snapshot payload: the envelope
//! decoder, the attribute field mapper, and the per-message handler that ties
//! cache resolution, diffing and the conditional update together.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Envelope decoding, cloud id and candidate IP extraction.
pub mod decoder;
/// Pure attribute extraction from a snapshot body.
pub mod field_map;
/// Resolve, diff and write for one raw message.
pub mod handler;

pub use decoder::{encode_envelope, DecodeError, Snapshot};
pub use field_map::{extract_attributes, HostAttributes};
pub use handler::{snapshot_key, HostSnapHandler};
