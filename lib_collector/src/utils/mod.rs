//! # Utilities Module
//!
//! Small helpers shared by the engine and the binaries.

/// Instance identity generation.
pub mod identity;
