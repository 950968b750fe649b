//! Common test utilities for multi-node integration testing
//!
//! `TestCluster` runs several `ClusterManager`s inside one process, wired
//! together through a `MemoryNetwork`, with protocol intervals shortened so
//! convergence takes milliseconds.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use cumulus_api::NodeBuilder;
use cumulus_core::{ClusterConfig, ClusterManager, transport::MemoryNetwork};
use uuid::Uuid;

/// Protocol settings tuned for tests
pub fn fast_config() -> ClusterConfig {
    ClusterConfig {
        replication_factor: 2,
        connection_loop_interval: Duration::from_millis(40),
        connection_jitter: Duration::from_millis(30),
        handshake_timeout: Duration::from_millis(500),
        wagon_timeout: Duration::from_millis(30),
        invoke_timeout: Duration::from_millis(500),
        lock_retry_interval: Duration::from_millis(50),
        accept_unknown_peers: true,
        event_queue_size: 256,
        discovery: None,
    }
}

pub fn address(index: usize) -> String {
    format!("10.0.0.{}:7000", index + 1)
}

pub struct TestCluster {
    pub network: MemoryNetwork,
    pub nodes: Vec<ClusterManager>,
}

impl TestCluster {
    /// Create `size` members with ids 1..=size; nothing is started yet
    pub fn new(size: usize, config: ClusterConfig) -> Self {
        let network = MemoryNetwork::new();
        let nodes = (0..size)
            .map(|i| {
                let local = NodeBuilder::new(format!("10.0.0.{}", i + 1), 7000)
                    .id(Uuid::from_u128(i as u128 + 1))
                    .name(format!("node-{}", i + 1))
                    .local(true)
                    .build();
                let manager = ClusterManager::new(
                    local,
                    config.clone(),
                    Arc::new(network.transport(address(i))),
                );
                network.attach(address(i), Arc::new(manager.clone()));
                manager
            })
            .collect();
        Self { network, nodes }
    }

    /// Tell node `from` about node `to` by address only, the way a member list does
    pub fn introduce(&self, from: usize, to: usize) {
        self.nodes[from].register_known_node(
            NodeBuilder::new(format!("10.0.0.{}", to + 1), 7000).build(),
        );
    }

    /// Every node knows every other node
    pub fn introduce_all(&self) {
        for from in 0..self.nodes.len() {
            for to in 0..self.nodes.len() {
                if from != to {
                    self.introduce(from, to);
                }
            }
        }
    }

    pub async fn start(&self) {
        for node in &self.nodes {
            node.start().await.expect("start cluster member");
        }
    }

    pub async fn stop(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }

    pub fn id(&self, index: usize) -> Uuid {
        self.nodes[index].local_id()
    }

    /// Id under which node `from` currently registers node `to`
    pub fn known_id(&self, from: usize, to: usize) -> Option<Uuid> {
        self.nodes[from]
            .nodes()
            .into_iter()
            .find(|node| node.lan_id() == address(to))
            .map(|node| node.id)
    }

    pub fn fully_connected(&self) -> bool {
        self.nodes.iter().enumerate().all(|(i, node)| {
            (0..self.nodes.len())
                .filter(|j| *j != i)
                .all(|j| node.is_connected_to(&self.id(j)))
        })
    }

    pub async fn wait_fully_connected(&self) {
        assert!(
            wait_until(Duration::from_secs(10), || self.fully_connected()).await,
            "cluster did not converge"
        );
    }

    /// Number of transport connections between two members, counting both dial directions
    pub fn connections_between(&self, a: usize, b: usize) -> usize {
        self.network.sessions_between(&address(a), &address(b))
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
