//! Integration tests for application messages and wagon delivery

mod common;

use std::{sync::Arc, time::Duration};

use common::{TestCluster, fast_config, wait_until};
use cumulus_core::{Delivery, MessageHandler};
use parking_lot::Mutex;
use serde_json::{Value, json};
use uuid::Uuid;

#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<(Uuid, Value)>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.received.lock().len()
    }

    fn bodies(&self) -> Vec<Value> {
        self.received.lock().iter().map(|(_, b)| b.clone()).collect()
    }
}

#[async_trait::async_trait]
impl MessageHandler for Recorder {
    async fn on_message(&self, origin: Uuid, body: Value) {
        self.received.lock().push((origin, body));
    }
}

// ============================================================================
// Direct delivery
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_direct_message_reaches_handler() {
    let cluster = TestCluster::new(2, fast_config());
    cluster.introduce_all();
    let recorder = Arc::new(Recorder::default());
    cluster.nodes[1].register_handler("greetings", recorder.clone());
    cluster.start().await;
    cluster.wait_fully_connected().await;

    let delivery = cluster.nodes[0]
        .send_message(cluster.id(1), "greetings", json!("hello"))
        .await;
    assert_eq!(delivery, Delivery::Direct);
    assert!(wait_until(Duration::from_secs(5), || recorder.count() == 1).await);

    let received = recorder.received.lock().clone();
    assert_eq!(received, vec![(cluster.id(0), json!("hello"))]);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_to_self_is_dispatched_locally() {
    let cluster = TestCluster::new(1, fast_config());
    let recorder = Arc::new(Recorder::default());
    cluster.nodes[0].register_handler("loopback", recorder.clone());

    let delivery = cluster.nodes[0]
        .send_message(cluster.id(0), "loopback", json!({"n": 1}))
        .await;
    assert_eq!(delivery, Delivery::Direct);
    assert!(wait_until(Duration::from_secs(2), || recorder.count() == 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_reaches_every_connected_node() {
    let cluster = TestCluster::new(3, fast_config());
    cluster.introduce_all();
    let recorders: Vec<_> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
    for (node, recorder) in cluster.nodes.iter().zip(&recorders) {
        node.register_handler("news", recorder.clone());
    }
    cluster.start().await;
    cluster.wait_fully_connected().await;

    let mut reached = cluster.nodes[0].broadcast_message("news", json!(42)).await;
    reached.sort();
    assert_eq!(reached, vec![cluster.id(1), cluster.id(2)]);
    assert!(
        wait_until(Duration::from_secs(5), || {
            recorders[1].count() == 1 && recorders[2].count() == 1
        })
        .await
    );
    // The sender does not receive its own broadcast
    assert_eq!(recorders[0].count(), 0);

    cluster.stop().await;
}

// ============================================================================
// Wagon delivery
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_to_unreachable_node_is_queued_then_delivered() {
    let cluster = TestCluster::new(3, fast_config());
    cluster.introduce_all();
    let recorder = Arc::new(Recorder::default());
    cluster.nodes[2].register_handler("orders", recorder.clone());
    cluster.start().await;
    cluster.wait_fully_connected().await;

    let c = common::address(2);
    let c_id = cluster.id(2);
    cluster.network.isolate(&c);
    assert!(
        wait_until(Duration::from_secs(5), || {
            !cluster.nodes[0].is_connected_to(&c_id)
        })
        .await
    );

    let delivery = cluster.nodes[0]
        .send_message(c_id, "orders", json!({"id": 7}))
        .await;
    assert_eq!(delivery, Delivery::Queued);
    assert_eq!(recorder.count(), 0);

    cluster.network.restore(&c);
    assert!(wait_until(Duration::from_secs(10), || recorder.count() == 1).await);
    assert_eq!(recorder.bodies(), vec![json!({"id": 7})]);

    // Delivered exactly once
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.count(), 1);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_to_node_known_by_address_arrives_after_handshake() {
    let cluster = TestCluster::new(2, fast_config());
    cluster.introduce(0, 1);
    let recorder = Arc::new(Recorder::default());
    cluster.nodes[1].register_handler("orders", recorder.clone());

    let placeholder = cluster.known_id(0, 1).unwrap();
    assert_ne!(placeholder, cluster.id(1));
    let delivery = cluster.nodes[0]
        .send_message(placeholder, "orders", json!({"id": 1}))
        .await;
    assert_eq!(delivery, Delivery::Queued);
    assert_eq!(cluster.nodes[0].status().await.queued_messages, 1);

    cluster.start().await;
    cluster.wait_fully_connected().await;
    assert_eq!(cluster.known_id(0, 1), Some(cluster.id(1)));

    assert!(wait_until(Duration::from_secs(10), || recorder.count() == 1).await);
    let received = recorder.received.lock().clone();
    assert_eq!(received, vec![(cluster.id(0), json!({"id": 1}))]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.count(), 1);
    assert_eq!(cluster.nodes[0].status().await.queued_messages, 0);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_without_handler_is_dropped() {
    let cluster = TestCluster::new(2, fast_config());
    cluster.introduce_all();
    let recorder = Arc::new(Recorder::default());
    cluster.nodes[1].register_handler("known", recorder.clone());
    cluster.start().await;
    cluster.wait_fully_connected().await;

    cluster.nodes[0]
        .send_message(cluster.id(1), "unknown", json!(null))
        .await;
    cluster.nodes[0]
        .send_message(cluster.id(1), "known", json!(true))
        .await;
    assert!(wait_until(Duration::from_secs(5), || recorder.count() == 1).await);
    assert_eq!(recorder.bodies(), vec![json!(true)]);

    cluster.stop().await;
}
