// Cluster services: membership, replication, locking and wagon delivery

pub mod cluster;
pub mod correlator;
pub mod discovery;
pub mod lock;
pub mod member_event;
pub mod member_lookup;
pub mod membership;
pub mod messenger;
pub mod registry;
pub mod replication;
pub mod session;
pub mod store;
pub mod wagon;

// Re-export commonly used types
pub use cluster::{ClusterManager, ClusterStatus, MessageHandler};
pub use lock::LockStatus;
pub use messenger::Delivery;
