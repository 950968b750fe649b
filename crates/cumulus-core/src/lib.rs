//! Cumulus Core - peer-to-peer cluster coordination
//!
//! This crate provides:
//! - Node registry and the identification handshake
//! - Replicated path/object store with remote pointers and invoke RPC
//! - Distributed per-path lock
//! - Wagon token circulation for store-and-forward delivery
//! - Transport abstraction and an in-process transport

pub mod model;
pub mod service;
pub mod transport;

// Re-export cluster module
pub mod cluster {
    pub use crate::service::cluster::{ClusterManager, ClusterStatus, MessageHandler};
}

// Re-export commonly used types
pub use model::{ClusterConfig, Configuration};
pub use service::{ClusterManager, Delivery, LockStatus, MessageHandler};
pub use transport::{SessionId, Transport, TransportListener};

// Re-export common functions
pub use cumulus_common::local_ip;
