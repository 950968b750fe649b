// Node registry
// Holds every known node (including the local one), deduplicated by LAN and WAN id,
// and owns the atomic status transitions of the membership state machine.
// Entries learned by address only carry a placeholder id until the peer identifies itself.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use cumulus_api::{Node, NodeStatus};
use cumulus_common::{CumulusError, Result, current_millis};

use super::member_event::{NodeChangeEvent, NodeEventPublisher};

/// Outcome of learning a peer's real identity
#[derive(Clone, Debug, PartialEq)]
pub struct Adoption {
    /// Id the node is registered under from now on
    pub id: Uuid,
    /// Id the entry had before the handshake
    pub previous: Uuid,
    /// Other entries that described the same peer and were dropped
    pub evicted: Vec<Uuid>,
}

/// Registry status counts
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrySummary {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub disconnected: usize,
}

#[derive(Default)]
struct RegistryInner {
    nodes: HashMap<Uuid, Node>,
    by_lan: HashMap<String, Uuid>,
    by_wan: HashMap<String, Uuid>,
    /// Ids reported by the peers themselves, local included
    identified: HashSet<Uuid>,
}

impl RegistryInner {
    fn index(&mut self, node: &Node) {
        self.by_lan.insert(node.lan_id(), node.id);
        if let Some(wan_id) = node.wan_id() {
            self.by_wan.insert(wan_id, node.id);
        }
    }

    fn unindex(&mut self, node: &Node) {
        let lan_id = node.lan_id();
        if self.by_lan.get(&lan_id) == Some(&node.id) {
            self.by_lan.remove(&lan_id);
        }
        if let Some(wan_id) = node.wan_id()
            && self.by_wan.get(&wan_id) == Some(&node.id)
        {
            self.by_wan.remove(&wan_id);
        }
    }

    fn find(&self, node: &Node) -> Option<Uuid> {
        self.by_lan
            .get(&node.lan_id())
            .or_else(|| node.wan_id().and_then(|wan_id| self.by_wan.get(&wan_id)))
            .copied()
    }

    fn connected_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| !n.is_local && n.status == NodeStatus::Connected)
            .count()
    }
}

/// The known-node set of one cluster member
pub struct NodeRegistry {
    local_id: Uuid,
    inner: RwLock<RegistryInner>,
    events: Arc<NodeEventPublisher>,
}

impl NodeRegistry {
    pub fn new(mut local: Node, events: Arc<NodeEventPublisher>) -> Self {
        local.is_local = true;
        local.status = NodeStatus::Connected;
        local.last_status_update = current_millis();

        let mut inner = RegistryInner::default();
        inner.index(&local);
        let local_id = local.id;
        inner.identified.insert(local_id);
        inner.nodes.insert(local_id, local);

        Self {
            local_id,
            inner: RwLock::new(inner),
            events,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn local_node(&self) -> Node {
        self.inner.read().nodes[&self.local_id].clone()
    }

    /// Add a node known by address unless one with the same id, LAN id or WAN id exists.
    ///
    /// Returns whether the node was added. The node enters as DISCONNECTED and
    /// becomes a candidate of the connection loop. Its id stays a placeholder
    /// until the handshake reports the real one.
    pub fn register_known_node(&self, node: Node) -> bool {
        self.register(node, false)
    }

    /// Add a node whose id came from the peer itself, such as a discovery packet
    pub fn register_identified_node(&self, node: Node) -> bool {
        self.register(node, true)
    }

    fn register(&self, mut node: Node, identified: bool) -> bool {
        node.is_local = false;
        node.status = NodeStatus::Disconnected;
        node.last_status_update = current_millis();

        {
            let mut inner = self.inner.write();
            if inner.nodes.contains_key(&node.id) || inner.find(&node).is_some() {
                debug!("Node {} already known, skipping registration", node.lan_id());
                return false;
            }
            inner.index(&node);
            if identified {
                inner.identified.insert(node.id);
            }
            inner.nodes.insert(node.id, node.clone());
        }

        self.events.publish(NodeChangeEvent::node_join(node));
        true
    }

    /// Look a peer up by its LAN id, then by its WAN id
    pub fn find_by_address(&self, node: &Node) -> Option<Uuid> {
        self.inner.read().find(node)
    }

    pub fn get(&self, id: &Uuid) -> Option<Node> {
        self.inner.read().nodes.get(id).cloned()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.inner.read().nodes.contains_key(id)
    }

    /// Whether `id` is a node's real id rather than an address-only placeholder
    pub fn is_identified(&self, id: &Uuid) -> bool {
        let inner = self.inner.read();
        inner.nodes.contains_key(id) && inner.identified.contains(id)
    }

    pub fn status(&self, id: &Uuid) -> Option<NodeStatus> {
        self.inner.read().nodes.get(id).map(|n| n.status)
    }

    /// Check-and-set a status transition.
    ///
    /// Returns the previous status, or `IllegalTransition` when the state
    /// machine does not permit `from -> to`.
    pub fn change_status(&self, id: &Uuid, to: NodeStatus) -> Result<NodeStatus> {
        let (from, snapshot, connected) = {
            let mut inner = self.inner.write();
            let node = inner
                .nodes
                .get_mut(id)
                .ok_or_else(|| CumulusError::UnknownNode(id.to_string()))?;
            let from = node.status;
            if node.is_local || !from.can_transition_to(to) {
                return Err(CumulusError::IllegalTransition {
                    node: node.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            node.status = to;
            node.last_status_update = current_millis();
            let snapshot = node.clone();
            (from, snapshot, inner.connected_count())
        };

        metrics::gauge!("cumulus_connected_nodes").set(connected as f64);
        self.events
            .publish(NodeChangeEvent::node_status_change(snapshot, from));
        Ok(from)
    }

    /// Replace the identity of entry `id` with what the peer reported.
    ///
    /// The entry is re-keyed under the peer's real id. Any other entry that
    /// already used that id or the peer's LAN/WAN ids is evicted, keeping at
    /// most one entry per peer.
    pub fn adopt_identity(&self, id: &Uuid, peer: &Node) -> Option<Adoption> {
        let (adoption, snapshot) = {
            let mut inner = self.inner.write();
            let mut node = inner.nodes.remove(id)?;
            inner.unindex(&node);
            inner.identified.remove(id);
            node.adopt_identity(peer);

            let mut evicted = Vec::new();
            if let Some(existing) = inner.nodes.get(&node.id)
                && !existing.is_local
            {
                evicted.push(node.id);
            }
            if let Some(other) = inner.find(&node)
                && other != node.id
                && other != self.local_id
            {
                evicted.push(other);
            }
            for other in &evicted {
                if let Some(old) = inner.nodes.remove(other) {
                    warn!("Dropping duplicate registry entry {} for {}", old, node);
                    inner.unindex(&old);
                }
                inner.identified.remove(other);
            }

            inner.index(&node);
            inner.identified.insert(node.id);
            let snapshot = node.clone();
            inner.nodes.insert(node.id, node);
            (
                Adoption {
                    id: snapshot.id,
                    previous: *id,
                    evicted,
                },
                snapshot,
            )
        };

        self.events.publish(NodeChangeEvent::node_identified(snapshot));
        Some(adoption)
    }

    /// Forget a remote node entirely
    pub fn remove(&self, id: &Uuid) -> Option<Node> {
        if *id == self.local_id {
            return None;
        }
        let mut inner = self.inner.write();
        let node = inner.nodes.remove(id)?;
        inner.unindex(&node);
        inner.identified.remove(id);
        Some(node)
    }

    /// All known nodes including the local one, ordered by id
    pub fn snapshot(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.inner.read().nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Every other known node in ring order, starting right after `id`
    pub fn ring_after(&self, id: &Uuid) -> Vec<Node> {
        let nodes = self.snapshot();
        let ids: Vec<Uuid> = nodes.iter().map(|n| n.id).collect();
        let order = ring_order_after(&ids, id);
        let mut by_id: HashMap<Uuid, Node> = nodes.into_iter().map(|n| (n.id, n)).collect();
        order
            .into_iter()
            .filter_map(|node_id| by_id.remove(&node_id))
            .collect()
    }

    /// Remote nodes the connection loop should dial
    pub fn connection_candidates(&self) -> Vec<Node> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|n| !n.is_local && n.status == NodeStatus::Disconnected)
            .cloned()
            .collect()
    }

    /// Nodes that have been CONNECTING for longer than `timeout_ms`
    pub fn stale_handshakes(&self, timeout_ms: i64) -> Vec<Uuid> {
        let now = current_millis();
        self.inner
            .read()
            .nodes
            .values()
            .filter(|n| {
                n.status == NodeStatus::Connecting && now - n.last_status_update > timeout_ms
            })
            .map(|n| n.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    pub fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read();
        let mut summary = RegistrySummary::default();
        for node in inner.nodes.values().filter(|n| !n.is_local) {
            summary.total += 1;
            match node.status {
                NodeStatus::Connected => summary.connected += 1,
                NodeStatus::Connecting => summary.connecting += 1,
                NodeStatus::Disconnected => summary.disconnected += 1,
            }
        }
        summary
    }
}

/// Ring order over sorted ids: everything after `id`, wrapping around, excluding `id`.
///
/// When `id` is not part of `ordered` the walk starts at the first id greater
/// than it.
pub fn ring_order_after(ordered: &[Uuid], id: &Uuid) -> Vec<Uuid> {
    let start = ordered.partition_point(|candidate| candidate <= id);
    ordered[start..]
        .iter()
        .chain(ordered[..start].iter())
        .filter(|candidate| *candidate != id)
        .copied()
        .collect()
}

/// The next id after `id` in ring order, or `id` itself when it is alone
pub fn ring_successor(ordered: &[Uuid], id: &Uuid) -> Uuid {
    ring_order_after(ordered, id)
        .first()
        .copied()
        .unwrap_or(*id)
}
