//! Cumulus Common - Shared error types and utilities
//!
//! This crate provides the foundational pieces used across all Cumulus crates:
//! - `CumulusError` and the crate-wide `Result` alias
//! - Utility functions (local address detection, clock, identifier validation)

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{CumulusError, Result};
pub use utils::{current_millis, is_valid, local_ip};

/// Default cluster name used when none is configured
pub const DEFAULT_CLUSTER_NAME: &str = "default";

/// Default data center name
pub const DEFAULT_DATA_CENTER: &str = "dc1";

/// Default LAN port for cluster sessions
pub const DEFAULT_LAN_PORT: u16 = 7946;
