//! # Configuration Modules
//!
//! Layered collector configuration: built-in defaults, a JSON file, then
//! environment variables and command-line flags.

/// Collector configuration loading and resolution.
pub mod config_collector;
