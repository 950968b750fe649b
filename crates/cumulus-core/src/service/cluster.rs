// Cluster management and coordination
// Wires the registry, membership, replication, lock and wagon services together,
// owns their background tasks and dispatches every inbound message

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use serde_json::Value;
use tokio::{
    sync::{Mutex, broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cumulus_api::{Message, Node, Payload, StorePath};
use cumulus_common::{CumulusError, Result, current_millis};

use crate::{
    model::{ClusterConfig, Configuration},
    transport::{SessionId, Transport, TransportListener},
};

use super::{
    correlator::ResponseCorrelator,
    discovery::BroadcastDiscovery,
    lock::{LockService, LockStatus},
    member_event::{NodeChangeEvent, NodeChangeListener, NodeEventPublisher},
    member_lookup::FileMemberLookup,
    membership::MembershipService,
    messenger::{ClusterMessenger, Delivery},
    registry::{NodeRegistry, RegistrySummary},
    replication::ReplicationService,
    session::SessionIndex,
    store::{Entry, ReplicatedStore},
    wagon::{WagonMailbox, WagonService},
};

/// Receives application messages for one topic
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, origin: Uuid, body: Value);
}

/// Point-in-time view of the local node's cluster state
#[derive(Clone, Debug)]
pub struct ClusterStatus {
    pub local: Node,
    pub nodes: RegistrySummary,
    pub live_sessions: usize,
    /// Values and remote pointers in the local tree
    pub stored_leaves: usize,
    pub queued_messages: usize,
    pub holding_wagon: bool,
    pub running: bool,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct ClusterInner {
    config: ClusterConfig,
    events: Arc<NodeEventPublisher>,
    registry: Arc<NodeRegistry>,
    sessions: Arc<SessionIndex>,
    messenger: Arc<ClusterMessenger>,
    membership: Arc<MembershipService>,
    replication: Arc<ReplicationService>,
    locks: Arc<LockService>,
    wagon: Arc<WagonService>,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    running: Mutex<Option<Running>>,
}

/// A cluster member.
///
/// Cheap to clone; every clone drives the same node. Attach a clone to the
/// transport as its `TransportListener` so inbound traffic reaches it.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("local", &self.inner.registry.local_node().to_string())
            .field("known_nodes", &self.inner.registry.len())
            .field("live_sessions", &self.inner.sessions.len())
            .finish()
    }
}

impl ClusterManager {
    pub fn new(local: Node, config: ClusterConfig, transport: Arc<dyn Transport>) -> Self {
        let events = Arc::new(NodeEventPublisher::new(config.event_queue_size));
        let registry = Arc::new(NodeRegistry::new(local, events.clone()));
        let local_id = registry.local_id();

        let sessions = Arc::new(SessionIndex::new());
        let correlator = Arc::new(ResponseCorrelator::new());
        let mailbox = Arc::new(WagonMailbox::new());
        let messenger = Arc::new(ClusterMessenger::new(
            transport,
            sessions.clone(),
            correlator,
            mailbox.clone(),
        ));

        let wagon = Arc::new(WagonService::new(
            registry.clone(),
            config.wagon_timeout,
            mailbox,
            sessions.clone(),
            messenger.clone(),
        ));
        let membership = Arc::new(MembershipService::new(
            registry.clone(),
            sessions.clone(),
            messenger.clone(),
            wagon.clone(),
            config.clone(),
        ));
        let replication = Arc::new(ReplicationService::new(
            Arc::new(ReplicatedStore::new()),
            registry.clone(),
            sessions.clone(),
            messenger.clone(),
            config.replication_factor,
            config.invoke_timeout,
        ));
        let locks = Arc::new(LockService::new(
            local_id,
            messenger.clone(),
            config.invoke_timeout,
            config.lock_retry_interval,
        ));

        Self {
            inner: Arc::new(ClusterInner {
                config,
                events,
                registry,
                sessions,
                messenger,
                membership,
                replication,
                locks,
                wagon,
                handlers: DashMap::new(),
                running: Mutex::new(None),
            }),
        }
    }

    /// Build a member from application configuration and seed the static members
    pub fn from_configuration(config: &Configuration, transport: Arc<dyn Transport>) -> Self {
        let manager = Self::new(
            config.local_node(),
            ClusterConfig::from_configuration(config),
            transport,
        );
        let lookup = FileMemberLookup::new(config);
        for member in lookup.get_members() {
            manager.register_known_node(member);
        }
        manager
    }

    /// Start the background loops
    pub async fn start(&self) -> Result<()> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        info!(
            "Starting cluster member {}",
            self.inner.registry.local_node()
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        {
            let events = self.inner.events.clone();
            let rx = events.subscribe();
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                events.run_listeners(rx, shutdown_rx).await
            }));
        }

        tasks.push(tokio::spawn(
            self.inner.membership.clone().run(shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(
            self.inner.wagon.clone().run(shutdown_rx.clone()),
        ));

        if let Some(discovery_config) = self.inner.config.discovery.clone() {
            let discovery = Arc::new(BroadcastDiscovery::new(
                self.inner.registry.clone(),
                discovery_config,
            ));
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = discovery.run(shutdown_rx).await {
                    error!("Broadcast discovery failed: {}", e);
                }
            }));
        }

        *running = Some(Running { shutdown, tasks });
        info!("Cluster member started");
        Ok(())
    }

    /// Stop the background loops and close every session
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().await.take() else {
            return;
        };

        info!("Stopping cluster member");
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!("Cluster task ended abnormally: {}", e);
            }
        }

        self.inner.membership.disconnect_all().await;
        self.inner.wagon.reset();
        info!("Cluster member stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    // ===================== Membership =====================

    pub fn local_node(&self) -> Node {
        self.inner.registry.local_node()
    }

    pub fn local_id(&self) -> Uuid {
        self.inner.registry.local_id()
    }

    /// Add a peer to dial; returns false if it is already known
    pub fn register_known_node(&self, node: Node) -> bool {
        self.inner.registry.register_known_node(node)
    }

    /// All known nodes, local included, in ring order
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.registry.snapshot()
    }

    pub fn node(&self, id: &Uuid) -> Option<Node> {
        self.inner.registry.get(id)
    }

    /// Nodes with a live session
    pub fn connected_nodes(&self) -> Vec<Uuid> {
        let mut nodes = self.inner.sessions.live_nodes();
        nodes.sort();
        nodes
    }

    pub fn is_connected_to(&self, node: &Uuid) -> bool {
        self.inner.sessions.has_session(node)
    }

    /// Run one connection cycle now instead of waiting for the loop
    pub async fn connect_now(&self) {
        self.inner.membership.connect_cycle().await;
    }

    pub async fn status(&self) -> ClusterStatus {
        ClusterStatus {
            local: self.local_node(),
            nodes: self.inner.registry.summary(),
            live_sessions: self.inner.sessions.len(),
            stored_leaves: self.inner.replication.store().leaf_count(),
            queued_messages: self.inner.wagon.mailbox().len(),
            holding_wagon: self.inner.wagon.is_holding(),
            running: self.is_running().await,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeChangeEvent> {
        self.inner.events.subscribe()
    }

    pub async fn register_listener(&self, listener: Arc<dyn NodeChangeListener>) {
        self.inner.events.register_listener(listener).await;
    }

    // ===================== Replicated Store =====================

    /// Publish `value` at `path` stamped with the current time
    pub async fn publish_object(&self, path: &StorePath, value: Value) -> Result<Vec<Uuid>> {
        self.publish_object_at(path, value, current_millis()).await
    }

    pub async fn publish_object_at(
        &self,
        path: &StorePath,
        value: Value,
        timestamp: i64,
    ) -> Result<Vec<Uuid>> {
        self.inner
            .replication
            .publish_object(path, value, timestamp)
            .await
    }

    /// Read the value at `path`, asking a holder if only a pointer is stored here
    pub async fn invoke(&self, path: &StorePath) -> Option<Value> {
        self.inner.replication.invoke(path).await
    }

    pub async fn publish_path(&self, path: &StorePath) -> Result<()> {
        self.inner.replication.publish_path(path).await
    }

    pub async fn hide_path(&self, path: &StorePath) {
        self.inner.replication.hide_path(path).await
    }

    pub fn list(&self, path: &StorePath) -> Option<Vec<String>> {
        self.inner.replication.list(path)
    }

    /// What `path` resolves to on this node, without asking peers
    pub fn local_entry(&self, path: &StorePath) -> Option<Entry> {
        self.inner.replication.store().get(path)
    }

    // ===================== Distributed Lock =====================

    pub async fn lock(&self, path: &StorePath) {
        self.inner.locks.lock(path).await
    }

    /// Like `lock`, giving up after `timeout`
    pub async fn try_lock(&self, path: &StorePath, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.inner.locks.lock(path))
            .await
            .map_err(|_| CumulusError::Timeout(timeout.as_millis() as u64))
    }

    pub async fn unlock(&self, path: &StorePath) {
        self.inner.locks.unlock(path).await
    }

    pub fn lock_status(&self, path: &StorePath) -> LockStatus {
        self.inner.locks.status(path)
    }

    // ===================== Application Messages =====================

    pub fn register_handler(&self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.insert(topic.into(), handler);
    }

    /// Send to `node` directly, or through the wagon when it is not reachable
    pub async fn send_message(&self, node: Uuid, topic: &str, body: Value) -> Delivery {
        let message = Message::new(Payload::Deliver {
            origin: self.local_id(),
            topic: topic.to_string(),
            body,
        });
        if node == self.local_id() {
            self.dispatch(None, message).await;
            return Delivery::Direct;
        }
        self.inner.messenger.deliver(node, message).await
    }

    /// Send to every connected node, returning the nodes reached
    pub async fn broadcast_message(&self, topic: &str, body: Value) -> Vec<Uuid> {
        let message = Message::new(Payload::Deliver {
            origin: self.local_id(),
            topic: topic.to_string(),
            body,
        });
        self.inner.messenger.broadcast(&message).await
    }

    // ===================== Dispatch =====================

    /// Dispatch one message; `session` is absent for messages carried by the wagon
    async fn dispatch(&self, session: Option<SessionId>, message: Message) {
        let inner = &self.inner;
        let message_id = message.id;
        match message.payload {
            Payload::Identification { node } => match session {
                Some(session) => {
                    inner
                        .membership
                        .on_identification(session, message_id, node)
                        .await
                }
                None => debug!("Dropping identification carried by the wagon"),
            },
            Payload::BusyNode { node } => {
                if let Some(session) = session {
                    inner.membership.on_busy(session, &node).await;
                }
            }
            Payload::Ack { reference } => {
                let handshake = match session {
                    Some(session) => inner.membership.on_ack(session, &reference).await,
                    None => false,
                };
                if !handshake && !inner.wagon.handle_ack(&reference) {
                    debug!("Unmatched ack for {}", reference);
                }
            }
            Payload::PublishPath { path } => inner.replication.on_publish_path(&path),
            Payload::HidePath { path } => inner.replication.on_hide_path(&path),
            Payload::PublishObject {
                path,
                timestamp,
                holders,
                value,
            } => {
                inner
                    .replication
                    .on_publish_object(&path, timestamp, holders, value);
            }
            Payload::Invoke { path } => {
                let response = inner.replication.answer_invoke(message_id, &path);
                self.reply(session, &response).await;
            }
            Payload::Response { reference, value } => {
                inner.messenger.correlator().resolve(&reference, value);
            }
            Payload::Lock { path, timestamp } => {
                let requester = session.and_then(|s| inner.sessions.peer_of(&s));
                let granted = inner.locks.vote(requester, &path, timestamp);
                let response = Message::response(message_id, Some(Value::Bool(granted)));
                self.reply(session, &response).await;
            }
            Payload::Unlock { path } => inner.locks.on_remote_unlock(&path),
            Payload::CloudWagon { .. } => debug!("Dropping wagon nested in a wagon"),
            Payload::Deliver {
                origin,
                topic,
                body,
            } => match inner.handlers.get(&topic).map(|h| h.value().clone()) {
                Some(handler) => {
                    tokio::spawn(async move { handler.on_message(origin, body).await });
                }
                None => debug!("No handler for topic '{}', dropping", topic),
            },
        }
    }

    async fn reply(&self, session: Option<SessionId>, response: &Message) {
        let Some(session) = session else {
            debug!("Cannot answer a request carried by the wagon");
            return;
        };
        if let Err(e) = self.inner.messenger.send(session, response).await {
            debug!("Reply on {} failed: {}", session, e);
        }
    }
}

#[async_trait::async_trait]
impl TransportListener for ClusterManager {
    async fn on_message(&self, session: SessionId, message: Message) {
        metrics::counter!("cumulus_messages_received_total", "type" => message.kind())
            .increment(1);

        let Message { id, payload } = message;
        match payload {
            Payload::CloudWagon { wagon } => {
                let delivered = self.inner.wagon.receive(wagon);
                if let Err(e) = self.inner.messenger.send(session, &Message::ack(id)).await {
                    debug!("Acknowledging wagon on {} failed: {}", session, e);
                }
                for message in delivered {
                    self.dispatch(None, message).await;
                }
            }
            payload => self.dispatch(Some(session), Message { id, payload }).await,
        }
    }

    async fn on_session_lost(&self, session: SessionId) {
        self.inner.membership.connection_lost(session);
    }
}
