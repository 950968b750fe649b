// Broadcast discovery
// Announces the local node on the LAN broadcast address and registers every
// peer of the same cluster that answers or announces itself

use std::{net::SocketAddr, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, sync::watch};
use tracing::{debug, info, warn};

use cumulus_api::Node;
use cumulus_common::Result;

use crate::model::DiscoveryConfig;

use super::registry::NodeRegistry;

const MAX_PACKET_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DiscoveryPacket {
    Ping { node: Node },
    Pong { node: Node },
}

pub struct BroadcastDiscovery {
    registry: Arc<NodeRegistry>,
    config: DiscoveryConfig,
}

impl BroadcastDiscovery {
    pub fn new(registry: Arc<NodeRegistry>, config: DiscoveryConfig) -> Self {
        Self { registry, config }
    }

    /// Register the sender of `packet`; a ping from a new peer is answered with a pong
    pub fn handle_packet(&self, packet: DiscoveryPacket) -> Option<DiscoveryPacket> {
        let local = self.registry.local_node();
        let (node, is_ping) = match packet {
            DiscoveryPacket::Ping { node } => (node, true),
            DiscoveryPacket::Pong { node } => (node, false),
        };

        if node.id == local.id || node.cluster_name != local.cluster_name {
            return None;
        }
        if self.registry.register_identified_node(node.clone()) {
            info!("Discovered {} via broadcast", node);
        }
        is_ping.then_some(DiscoveryPacket::Pong { node: local })
    }

    /// Ping the broadcast address periodically and answer peers until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.port)).await?;
        socket.set_broadcast(true)?;
        let target = SocketAddr::from(([255, 255, 255, 255], self.config.port));
        info!("Broadcast discovery listening on port {}", self.config.port);

        let mut ticker = tokio::time::interval(self.config.interval);
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ping = DiscoveryPacket::Ping { node: self.registry.local_node() };
                    let bytes = serde_json::to_vec(&ping)?;
                    if let Err(e) = socket.send_to(&bytes, target).await {
                        warn!("Discovery ping failed: {}", e);
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("Discovery receive failed: {}", e);
                            continue;
                        }
                    };
                    let packet = match serde_json::from_slice::<DiscoveryPacket>(&buf[..len]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            debug!("Ignoring malformed discovery packet from {}: {}", from, e);
                            continue;
                        }
                    };
                    if let Some(reply) = self.handle_packet(packet) {
                        let bytes = serde_json::to_vec(&reply)?;
                        if let Err(e) = socket.send_to(&bytes, from).await {
                            debug!("Discovery pong to {} failed: {}", from, e);
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Broadcast discovery stopped");
        Ok(())
    }
}
