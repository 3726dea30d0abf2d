//! # Loggers Module
//!
//! Process-wide `tracing` subscriber setup shared by every binary.

/// Console plus rolling JSON file logging.
pub mod setup;
