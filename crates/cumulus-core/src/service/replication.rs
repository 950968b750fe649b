// Replication service
// Publishes values to a replica set chosen in ring order, resolves remote
// pointers through invoke requests and mirrors directory changes to peers

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use cumulus_api::{Message, Payload, StorePath};
use cumulus_common::{CumulusError, Result};

use super::{
    messenger::ClusterMessenger,
    registry::NodeRegistry,
    session::SessionIndex,
    store::{Entry, Leaf, ReplicatedStore, WriteOutcome},
};

pub struct ReplicationService {
    store: Arc<ReplicatedStore>,
    registry: Arc<NodeRegistry>,
    sessions: Arc<SessionIndex>,
    messenger: Arc<ClusterMessenger>,
    replication_factor: usize,
    invoke_timeout: Duration,
}

impl ReplicationService {
    pub fn new(
        store: Arc<ReplicatedStore>,
        registry: Arc<NodeRegistry>,
        sessions: Arc<SessionIndex>,
        messenger: Arc<ClusterMessenger>,
        replication_factor: usize,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            sessions,
            messenger,
            replication_factor,
            invoke_timeout,
        }
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }

    /// Write `value` locally and replicate it.
    ///
    /// The first `replication_factor` identified nodes after the local one in
    /// ring order receive the value; every other node, including those still
    /// known by address only, receives a pointer. Returns the holders, or an
    /// empty list when a newer value already exists locally.
    pub async fn publish_object(
        &self,
        path: &StorePath,
        value: Value,
        timestamp: i64,
    ) -> Result<Vec<Uuid>> {
        let local_id = self.registry.local_id();
        let written = self.store.put_leaf(
            path,
            Leaf::Local {
                value: value.clone(),
                timestamp,
            },
        );
        match written {
            WriteOutcome::Written => {}
            WriteOutcome::Stale => {
                debug!("Not replicating stale value for {}", path);
                return Ok(Vec::new());
            }
            WriteOutcome::Rejected => {
                return Err(CumulusError::IllegalArgument(format!(
                    "cannot store a value at {}",
                    path
                )));
            }
        }

        let ring: Vec<Uuid> = self
            .registry
            .ring_after(&local_id)
            .into_iter()
            .map(|node| node.id)
            .collect();
        let replicas: Vec<Uuid> = ring
            .iter()
            .filter(|node| self.registry.is_identified(node))
            .take(self.replication_factor)
            .copied()
            .collect();
        let mut holders = replicas.clone();
        holders.push(local_id);

        for node in &ring {
            let message = Message::new(Payload::PublishObject {
                path: path.clone(),
                timestamp,
                holders: holders.clone(),
                value: replicas.contains(node).then(|| value.clone()),
            });
            self.messenger.deliver(*node, message).await;
        }

        debug!("Published {} to holders {:?}", path, holders);
        Ok(holders)
    }

    /// Apply a replicated leaf from a peer
    pub fn on_publish_object(
        &self,
        path: &StorePath,
        timestamp: i64,
        holders: Vec<Uuid>,
        value: Option<Value>,
    ) -> WriteOutcome {
        let leaf = match value {
            Some(value) => Leaf::Local { value, timestamp },
            None => Leaf::Remote { timestamp, holders },
        };
        let outcome = self.store.put_leaf(path, leaf);
        if outcome == WriteOutcome::Rejected {
            warn!("Dropping replicated object at {}: path conflict", path);
        }
        outcome
    }

    /// Read `path`, following a remote pointer to the first reachable holder
    pub async fn invoke(&self, path: &StorePath) -> Option<Value> {
        let holders = match self.store.get(path)? {
            Entry::Leaf(Leaf::Local { value, .. }) => return Some(value),
            Entry::Leaf(Leaf::Remote { holders, .. }) => holders,
            Entry::Directory(_) => return None,
        };

        let local_id = self.registry.local_id();
        let holder = holders
            .into_iter()
            .find(|holder| *holder != local_id && self.sessions.has_session(holder))?;

        match self
            .messenger
            .request(
                &holder,
                Payload::Invoke { path: path.clone() },
                self.invoke_timeout,
            )
            .await
        {
            Ok(value) => value,
            Err(e) => {
                debug!("Invoke of {} on {} failed: {}", path, holder, e);
                None
            }
        }
    }

    /// Answer an inbound invoke from the local tree only
    pub fn answer_invoke(&self, request_id: Uuid, path: &StorePath) -> Message {
        Message::response(request_id, self.store.local_value(path))
    }

    /// Create a directory locally and announce it to connected peers
    pub async fn publish_path(&self, path: &StorePath) -> Result<()> {
        if !self.store.create_directory(path) {
            return Err(CumulusError::IllegalArgument(format!(
                "a value already exists at {}",
                path
            )));
        }
        let message = Message::new(Payload::PublishPath { path: path.clone() });
        self.messenger.broadcast(&message).await;
        Ok(())
    }

    /// Remove a subtree locally and tell connected peers
    pub async fn hide_path(&self, path: &StorePath) {
        self.store.remove(path);
        let message = Message::new(Payload::HidePath { path: path.clone() });
        self.messenger.broadcast(&message).await;
    }

    pub fn on_publish_path(&self, path: &StorePath) {
        if !self.store.create_directory(path) {
            warn!("Ignoring published path {}: a value is in the way", path);
        }
    }

    pub fn on_hide_path(&self, path: &StorePath) {
        self.store.remove(path);
    }

    pub fn list(&self, path: &StorePath) -> Option<Vec<String>> {
        self.store.list(path)
    }
}
