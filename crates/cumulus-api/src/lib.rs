//! Cumulus API - wire models shared by every node
//!
//! - `model`: node identity and the connection status state machine
//! - `path`: slash-separated store paths
//! - `message`: the tagged message taxonomy exchanged between nodes

pub mod message;
pub mod model;
pub mod path;

pub use message::{Message, Payload, Wagon};
pub use model::{Node, NodeBuilder, NodeStatus};
pub use path::StorePath;
