//! Integration tests for the distributed lock

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::{TestCluster, fast_config, wait_until};
use cumulus_api::StorePath;
use cumulus_core::LockStatus;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lock_is_mutually_exclusive() {
    let cluster = Arc::new(TestCluster::new(3, fast_config()));
    cluster.introduce_all();
    cluster.start().await;
    cluster.wait_fully_connected().await;

    let path: StorePath = "jobs/compaction".parse().unwrap();
    let inside = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for index in 0..3 {
        let node = cluster.nodes[index].clone();
        let path = path.clone();
        let inside = inside.clone();
        let entries = entries.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..3 {
                node.lock(&path).await;
                let others = inside.fetch_add(1, Ordering::SeqCst);
                assert_eq!(others, 0, "two nodes hold the lock at once");
                entries.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                node.unlock(&path).await;
            }
        }));
    }

    let all = futures::future::join_all(workers);
    let results = tokio::time::timeout(Duration::from_secs(30), all)
        .await
        .expect("lock workers did not finish");
    for result in results {
        result.expect("lock worker panicked");
    }
    assert_eq!(entries.load(Ordering::SeqCst), 9);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiter_acquires_after_remote_unlock() {
    let cluster = TestCluster::new(2, fast_config());
    cluster.introduce_all();
    cluster.start().await;
    cluster.wait_fully_connected().await;

    let path: StorePath = "leases/primary".parse().unwrap();
    cluster.nodes[0].lock(&path).await;
    assert_eq!(cluster.nodes[0].lock_status(&path), LockStatus::Locked);

    let waiter = {
        let node = cluster.nodes[1].clone();
        let path = path.clone();
        tokio::spawn(async move { node.lock(&path).await })
    };

    let second = cluster.nodes[1].clone();
    let waiting_path = path.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            second.lock_status(&waiting_path) == LockStatus::Waiting
        })
        .await
    );
    assert!(!waiter.is_finished());

    cluster.nodes[0].unlock(&path).await;
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter was not woken")
        .unwrap();
    assert_eq!(cluster.nodes[1].lock_status(&path), LockStatus::Locked);
    assert_eq!(cluster.nodes[0].lock_status(&path), LockStatus::Unlocked);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_locks_on_different_paths_are_independent() {
    let cluster = TestCluster::new(2, fast_config());
    cluster.introduce_all();
    cluster.start().await;
    cluster.wait_fully_connected().await;

    let a: StorePath = "locks/a".parse().unwrap();
    let b: StorePath = "locks/b".parse().unwrap();
    cluster.nodes[0].lock(&a).await;
    tokio::time::timeout(Duration::from_secs(2), cluster.nodes[1].lock(&b))
        .await
        .expect("unrelated path was blocked");

    assert!(
        cluster.nodes[1]
            .try_lock(&a, Duration::from_millis(200))
            .await
            .is_err()
    );
    // The abandoned attempt leaves the object free again
    assert_eq!(cluster.nodes[1].lock_status(&a), LockStatus::Unlocked);

    cluster.stop().await;
}
