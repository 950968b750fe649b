// Membership protocol
// Drives the connection loop and the symmetric identification handshake:
//
//   connector                         receiver
//   Identification(self)  ------->    CONNECTING, adopt identity
//                         <-------    Identification(self) | BusyNode
//   adopt, CONNECTED, bind
//   Ack(reply id)         ------->    CONNECTED, bind

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cumulus_api::{Message, Node, NodeStatus, Payload};

use crate::{model::ClusterConfig, transport::SessionId};

use super::{
    messenger::ClusterMessenger,
    registry::{Adoption, NodeRegistry},
    session::SessionIndex,
    wagon::WagonService,
};

/// Address to dial: LAN inside the local data center, WAN across data centers
pub fn dial_address(local: &Node, node: &Node) -> String {
    match node.wan_id() {
        Some(wan_id) if node.data_center_name != local.data_center_name => wan_id,
        _ => node.lan_id(),
    }
}

pub struct MembershipService {
    registry: Arc<NodeRegistry>,
    sessions: Arc<SessionIndex>,
    messenger: Arc<ClusterMessenger>,
    wagon: Arc<WagonService>,
    config: ClusterConfig,
}

impl MembershipService {
    pub fn new(
        registry: Arc<NodeRegistry>,
        sessions: Arc<SessionIndex>,
        messenger: Arc<ClusterMessenger>,
        wagon: Arc<WagonService>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            registry,
            sessions,
            messenger,
            wagon,
            config,
        }
    }

    /// Run the connection loop until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Connection loop started, interval {:?}",
            self.config.connection_loop_interval
        );
        loop {
            self.connect_cycle().await;

            let jitter_ms = (self.config.connection_jitter.as_millis() as u64).max(1);
            let jitter = Duration::from_millis(rand::rng().random_range(0..jitter_ms));
            tokio::select! {
                _ = tokio::time::sleep(self.config.connection_loop_interval + jitter) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Connection loop stopped");
    }

    /// Expire stuck handshakes, then dial every disconnected node
    pub async fn connect_cycle(&self) {
        self.expire_handshakes().await;

        let local = self.registry.local_node();
        let candidates: Vec<Node> = self
            .registry
            .connection_candidates()
            .into_iter()
            .filter(|node| !self.sessions.has_session(&node.id))
            .collect();
        if candidates.is_empty() {
            return;
        }

        debug!("Dialing {} disconnected nodes", candidates.len());
        join_all(candidates.iter().map(|node| self.dial(&local, node))).await;
    }

    async fn dial(&self, local: &Node, node: &Node) {
        let address = dial_address(local, node);
        let session = match self.messenger.connect(&address).await {
            Ok(session) => session,
            Err(e) => {
                debug!("Cannot reach {} at {}: {}", node.name, address, e);
                return;
            }
        };

        if let Err(e) = self.registry.change_status(&node.id, NodeStatus::Connecting) {
            debug!("Abandoning dial to {}: {}", node, e);
            self.messenger.close(session).await;
            return;
        }

        self.sessions.begin_outbound(session, node.id);
        let offer = Message::new(Payload::Identification {
            node: local.clone(),
        });
        if let Err(e) = self.messenger.send(session, &offer).await {
            debug!("Identification to {} failed: {}", node, e);
            self.sessions.take_outbound(&session);
            self.disconnect(&node.id);
            self.messenger.close(session).await;
        }
    }

    /// Drive nodes stuck in CONNECTING back to DISCONNECTED
    pub async fn expire_handshakes(&self) {
        let timeout = self.config.handshake_timeout.as_millis() as i64;
        for node in self.registry.stale_handshakes(timeout) {
            warn!("Handshake with {} timed out", node);
            for session in self.sessions.forget_node(&node) {
                self.messenger.close(session).await;
            }
            self.disconnect(&node);
        }
    }

    fn disconnect(&self, node: &Uuid) {
        if let Err(e) = self.registry.change_status(node, NodeStatus::Disconnected) {
            debug!("{}", e);
        }
    }

    /// Move queued traffic to the adopted id and close sessions of evicted duplicates
    async fn settle_adoption(&self, adoption: &Adoption, keep: SessionId) {
        self.wagon.rekey(&adoption.previous, adoption.id);
        for evicted in &adoption.evicted {
            self.wagon.rekey(evicted, adoption.id);
            for session in self.sessions.forget_node(evicted) {
                if session != keep {
                    self.messenger.close(session).await;
                }
            }
        }
    }

    /// Handle an inbound `Identification`: a reply on a session we dialed, or a new offer
    pub async fn on_identification(&self, session: SessionId, message_id: Uuid, peer: Node) {
        let local = self.registry.local_node();

        if peer.id == local.id {
            match self.sessions.take_outbound(&session) {
                Some(node) => {
                    warn!("Dialed ourselves through {}, dropping the entry", session);
                    self.registry.remove(&node);
                    self.wagon.forget(&node);
                    self.messenger.close(session).await;
                }
                None => {
                    // Echo the identity back so the dialing side recognizes itself
                    let reply = Message::new(Payload::Identification { node: local });
                    if let Err(e) = self.messenger.send(session, &reply).await {
                        debug!("Self identification on {} failed: {}", session, e);
                    }
                }
            }
            return;
        }

        if peer.cluster_name != local.cluster_name {
            warn!(
                "Ignoring {} from foreign cluster '{}'",
                peer, peer.cluster_name
            );
            if let Some(node) = self.sessions.take_outbound(&session) {
                self.disconnect(&node);
                self.messenger.close(session).await;
            }
            return;
        }

        match self.sessions.take_outbound(&session) {
            Some(node) => self.complete_outbound(session, message_id, node, peer).await,
            None => self.accept_offer(session, &local, peer).await,
        }
    }

    /// Connector side: the receiver accepted our offer
    async fn complete_outbound(&self, session: SessionId, reply_id: Uuid, node: Uuid, peer: Node) {
        let Some(adoption) = self.registry.adopt_identity(&node, &peer) else {
            debug!("Dialed node {} vanished during the handshake", node);
            self.messenger.close(session).await;
            return;
        };
        self.settle_adoption(&adoption, session).await;

        if let Err(e) = self
            .registry
            .change_status(&adoption.id, NodeStatus::Connected)
        {
            debug!("Handshake with {} abandoned: {}", peer, e);
            self.messenger.close(session).await;
            return;
        }
        self.bind(adoption.id, session).await;

        if let Err(e) = self.messenger.send(session, &Message::ack(reply_id)).await {
            warn!("Acknowledging {} failed: {}", peer, e);
            self.connection_lost(session);
            self.messenger.close(session).await;
            return;
        }

        metrics::counter!("cumulus_handshakes_total", "side" => "connector").increment(1);
        info!("Connected to {}", peer);
    }

    /// Receiver side: a peer offers its identity
    async fn accept_offer(&self, session: SessionId, local: &Node, peer: Node) {
        let known = self
            .registry
            .find_by_address(&peer)
            .or_else(|| self.registry.contains(&peer.id).then_some(peer.id));

        let node = match known {
            Some(node) if node == local.id => {
                warn!("{} claims the local address, ignoring", peer);
                return;
            }
            Some(node) => node,
            None if self.config.accept_unknown_peers => {
                info!("Registering unknown peer {}", peer);
                self.registry.register_identified_node(peer.clone());
                match self.registry.find_by_address(&peer) {
                    Some(node) => node,
                    None => return,
                }
            }
            None => {
                warn!("Dropping identification from unknown peer {}", peer);
                return;
            }
        };

        if let Err(e) = self.registry.change_status(&node, NodeStatus::Connecting) {
            debug!("Busy with {}: {}", peer, e);
            let busy = Message::new(Payload::BusyNode {
                node: local.clone(),
            });
            if let Err(e) = self.messenger.send(session, &busy).await {
                debug!("BusyNode to {} failed: {}", peer, e);
            }
            return;
        }

        let Some(adoption) = self.registry.adopt_identity(&node, &peer) else {
            return;
        };
        self.settle_adoption(&adoption, session).await;

        let reply = Message::new(Payload::Identification {
            node: local.clone(),
        });
        self.sessions.expect_ack(reply.id, adoption.id, session);
        if let Err(e) = self.messenger.send(session, &reply).await {
            debug!("Identification reply to {} failed: {}", peer, e);
            self.sessions.take_ack(&reply.id);
            self.disconnect(&adoption.id);
        }
    }

    /// The receiver refused our offer; retry on a later cycle
    pub async fn on_busy(&self, session: SessionId, peer: &Node) {
        if let Some(node) = self.sessions.take_outbound(&session) {
            debug!("{} is busy, backing off", peer);
            self.disconnect(&node);
            self.messenger.close(session).await;
        }
    }

    /// Handle an `Ack`; returns false when it does not complete a handshake
    pub async fn on_ack(&self, session: SessionId, reference: &Uuid) -> bool {
        let Some(pending) = self.sessions.take_ack(reference) else {
            return false;
        };

        if let Err(e) = self
            .registry
            .change_status(&pending.node, NodeStatus::Connected)
        {
            debug!("Late handshake ack from {}: {}", pending.node, e);
            self.messenger.close(session).await;
            return true;
        }
        self.bind(pending.node, session).await;

        metrics::counter!("cumulus_handshakes_total", "side" => "receiver").increment(1);
        if let Some(node) = self.registry.get(&pending.node) {
            info!("Accepted connection from {}", node);
        }
        true
    }

    async fn bind(&self, node: Uuid, session: SessionId) {
        if let Some(previous) = self.sessions.bind(node, session) {
            debug!("Replacing {} of {} with {}", previous, node, session);
            self.messenger.close(previous).await;
        }
    }

    /// A session went away: unbind it and mark its node DISCONNECTED
    pub fn connection_lost(&self, session: SessionId) {
        if let Some(node) = self.sessions.forget_session(&session) {
            debug!("{} of {} lost", session, node);
            self.disconnect(&node);
        }
    }

    /// Close every session and mark all peers DISCONNECTED
    pub async fn disconnect_all(&self) {
        let sessions = self.sessions.clear();
        for node in self.registry.snapshot().iter().filter(|n| !n.is_local) {
            if node.status != NodeStatus::Disconnected {
                self.disconnect(&node.id);
            }
        }
        for session in sessions {
            self.messenger.close(session).await;
        }
    }
}
