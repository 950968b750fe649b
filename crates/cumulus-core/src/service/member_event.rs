// Node change event handling
// Provides event-driven notifications for cluster membership changes

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use cumulus_api::{Node, NodeStatus};
use cumulus_common::current_millis;

/// Type of node change event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeChangeType {
    /// A node became known to the registry
    NodeJoin,
    /// A node's connection status changed
    NodeStatusChange,
    /// A node's real identity was learned during a handshake
    NodeIdentified,
}

impl std::fmt::Display for NodeChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeChangeType::NodeJoin => write!(f, "NODE_JOIN"),
            NodeChangeType::NodeStatusChange => write!(f, "NODE_STATUS_CHANGE"),
            NodeChangeType::NodeIdentified => write!(f, "NODE_IDENTIFIED"),
        }
    }
}

/// Node change event
#[derive(Clone, Debug)]
pub struct NodeChangeEvent {
    /// Type of change
    pub change_type: NodeChangeType,
    /// The affected node, as of the change
    pub node: Node,
    /// Previous status (for status changes)
    pub previous_status: Option<NodeStatus>,
    /// Timestamp of the event
    pub timestamp: i64,
}

impl NodeChangeEvent {
    pub fn node_join(node: Node) -> Self {
        Self {
            change_type: NodeChangeType::NodeJoin,
            node,
            previous_status: None,
            timestamp: current_millis(),
        }
    }

    pub fn node_status_change(node: Node, previous_status: NodeStatus) -> Self {
        Self {
            change_type: NodeChangeType::NodeStatusChange,
            node,
            previous_status: Some(previous_status),
            timestamp: current_millis(),
        }
    }

    pub fn node_identified(node: Node) -> Self {
        Self {
            change_type: NodeChangeType::NodeIdentified,
            node,
            previous_status: None,
            timestamp: current_millis(),
        }
    }
}

/// Trait for handling node change events
#[async_trait::async_trait]
pub trait NodeChangeListener: Send + Sync {
    /// Called when a node change event occurs
    async fn on_node_change(&self, event: &NodeChangeEvent);
}

/// Node change event publisher
///
/// Publishing is synchronous so it can happen under the registry's lock;
/// listeners are driven by `run_listeners` on a separate task. A
/// `LoggingNodeChangeListener` is always registered.
pub struct NodeEventPublisher {
    broadcast_tx: broadcast::Sender<NodeChangeEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn NodeChangeListener>>>>,
}

impl NodeEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size.max(1));
        let logging: Arc<dyn NodeChangeListener> = Arc::new(LoggingNodeChangeListener);
        Self {
            broadcast_tx,
            listeners: Arc::new(RwLock::new(vec![logging])),
        }
    }

    /// Register a listener for node change events
    pub async fn register_listener(&self, listener: Arc<dyn NodeChangeListener>) {
        let mut listeners = self.listeners.write().await;
        listeners.push(listener);
        debug!("Registered node change listener, total: {}", listeners.len());
    }

    /// Publish a node change event; dropped when nobody subscribes
    pub fn publish(&self, event: NodeChangeEvent) {
        let _ = self.broadcast_tx.send(event);
    }

    /// Subscribe to node change events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeChangeEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Forward events to the registered listeners until `rx` closes or `shutdown` fires
    pub async fn run_listeners(
        &self,
        mut rx: broadcast::Receiver<NodeChangeEvent>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => {
                        let listeners = self.listeners.read().await;
                        for listener in listeners.iter() {
                            listener.on_node_change(&event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Node event listeners lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// A simple logging listener
pub struct LoggingNodeChangeListener;

#[async_trait::async_trait]
impl NodeChangeListener for LoggingNodeChangeListener {
    async fn on_node_change(&self, event: &NodeChangeEvent) {
        match event.change_type {
            NodeChangeType::NodeJoin => {
                info!(
                    "[NodeEvent] Node joined: {} (status: {})",
                    event.node, event.node.status
                );
            }
            NodeChangeType::NodeStatusChange => {
                if let Some(previous) = &event.previous_status {
                    info!(
                        "[NodeEvent] Node status changed: {} ({} -> {})",
                        event.node, previous, event.node.status
                    );
                }
            }
            NodeChangeType::NodeIdentified => {
                debug!("[NodeEvent] Node identified: {}", event.node);
            }
        }
    }
}
