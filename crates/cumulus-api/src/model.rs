// Node identity and connection status models
// A node is identified by its id but deduplicated by its LAN and WAN endpoints

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cumulus_common::{DEFAULT_CLUSTER_NAME, DEFAULT_DATA_CENTER, current_millis};

/// Connection status of a known node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Disconnected => "DISCONNECTED",
            NodeStatus::Connecting => "CONNECTING",
            NodeStatus::Connected => "CONNECTED",
        }
    }

    /// Whether `self -> next` is a permitted transition
    ///
    /// ```text
    /// DISCONNECTED -> CONNECTING
    /// CONNECTING   -> CONNECTED | DISCONNECTED
    /// CONNECTED    -> DISCONNECTED
    /// ```
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        matches!(
            (self, next),
            (NodeStatus::Disconnected, NodeStatus::Connecting)
                | (NodeStatus::Connecting, NodeStatus::Connected)
                | (NodeStatus::Connecting, NodeStatus::Disconnected)
                | (NodeStatus::Connected, NodeStatus::Disconnected)
        )
    }
}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity and reachability descriptor of a cluster node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub cluster_name: String,
    pub data_center_name: String,
    pub lan_address: String,
    pub lan_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wan_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wan_port: Option<u16>,
    pub startup_date: i64,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub last_status_update: i64,
    /// Only ever true for the process's own node; never sent over the wire
    #[serde(skip)]
    pub is_local: bool,
}

impl Node {
    /// `lan_address:lan_port`
    pub fn lan_id(&self) -> String {
        format!("{}:{}", self.lan_address, self.lan_port)
    }

    /// `wan_address:wan_port`, if the node has a WAN endpoint
    pub fn wan_id(&self) -> Option<String> {
        match (&self.wan_address, self.wan_port) {
            (Some(address), Some(port)) if !address.is_empty() => {
                Some(format!("{}:{}", address, port))
            }
            _ => None,
        }
    }

    /// Overwrite identity fields with what the peer reported about itself.
    ///
    /// Status, status timestamp and locality are owned by the local registry
    /// and are left untouched.
    pub fn adopt_identity(&mut self, peer: &Node) {
        self.id = peer.id;
        self.name = peer.name.clone();
        self.version = peer.version.clone();
        self.cluster_name = peer.cluster_name.clone();
        self.data_center_name = peer.data_center_name.clone();
        self.lan_address = peer.lan_address.clone();
        self.lan_port = peer.lan_port;
        self.wan_address = peer.wan_address.clone();
        self.wan_port = peer.wan_port;
        self.startup_date = peer.startup_date;
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}@{})", self.name, self.id, self.lan_id())
    }
}

/// Builder pattern for creating Node instances
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    pub fn new(lan_address: impl Into<String>, lan_port: u16) -> Self {
        let lan_address = lan_address.into();
        NodeBuilder {
            node: Node {
                id: Uuid::new_v4(),
                name: format!("{}:{}", lan_address, lan_port),
                version: String::new(),
                cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
                data_center_name: DEFAULT_DATA_CENTER.to_string(),
                lan_address,
                lan_port,
                wan_address: None,
                wan_port: None,
                startup_date: current_millis(),
                status: NodeStatus::Disconnected,
                last_status_update: current_millis(),
                is_local: false,
            },
        }
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.node.id = id;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.node.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.node.version = version.into();
        self
    }

    pub fn cluster_name(mut self, cluster_name: impl Into<String>) -> Self {
        self.node.cluster_name = cluster_name.into();
        self
    }

    pub fn data_center(mut self, data_center_name: impl Into<String>) -> Self {
        self.node.data_center_name = data_center_name.into();
        self
    }

    pub fn wan(mut self, address: impl Into<String>, port: u16) -> Self {
        self.node.wan_address = Some(address.into());
        self.node.wan_port = Some(port);
        self
    }

    pub fn local(mut self, is_local: bool) -> Self {
        self.node.is_local = is_local;
        self
    }

    pub fn build(self) -> Node {
        self.node
    }
}
