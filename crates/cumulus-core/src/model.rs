// Core configuration models
// Wraps the layered `config::Config` and derives the typed cluster runtime settings

use std::time::Duration;

use cumulus_api::{Node, NodeBuilder};
use cumulus_common::{DEFAULT_CLUSTER_NAME, DEFAULT_DATA_CENTER, DEFAULT_LAN_PORT, local_ip};

/// Application configuration wrapper
/// Provides access to configuration values for membership, replication, locking and the wagon
#[derive(Clone, Debug)]
pub struct Configuration {
    pub config: config::Config,
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.config
            .get_int(key)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default)
    }

    // ===================== Node Identity =====================

    /// Get the node name (default: `node-<lan port>`)
    pub fn node_name(&self) -> String {
        self.config
            .get_string("cumulus.node.name")
            .unwrap_or_else(|_| format!("node-{}", self.lan_port()))
    }

    /// Get the cluster name; nodes only connect to peers with the same name
    pub fn cluster_name(&self) -> String {
        self.config
            .get_string("cumulus.cluster.name")
            .unwrap_or_else(|_| DEFAULT_CLUSTER_NAME.to_string())
    }

    /// Get the data center name
    pub fn data_center_name(&self) -> String {
        self.config
            .get_string("cumulus.datacenter.name")
            .unwrap_or_else(|_| DEFAULT_DATA_CENTER.to_string())
    }

    /// Get the LAN address (default: first non-loopback IPv4)
    pub fn lan_address(&self) -> String {
        self.config
            .get_string("cumulus.lan.address")
            .unwrap_or_else(|_| local_ip())
    }

    /// Get the LAN port (default: 7946)
    pub fn lan_port(&self) -> u16 {
        self.config
            .get_int("cumulus.lan.port")
            .ok()
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(DEFAULT_LAN_PORT)
    }

    /// Get the WAN address, if one is configured
    pub fn wan_address(&self) -> Option<String> {
        self.config
            .get_string("cumulus.wan.address")
            .ok()
            .filter(|s| !s.is_empty())
    }

    /// Get the WAN port, if one is configured
    pub fn wan_port(&self) -> Option<u16> {
        self.config
            .get_int("cumulus.wan.port")
            .ok()
            .and_then(|v| u16::try_from(v).ok())
    }

    /// Get the node version
    pub fn version(&self) -> String {
        self.config
            .get_string("cumulus.version")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
    }

    /// Build the descriptor of the local node
    pub fn local_node(&self) -> Node {
        let mut builder = NodeBuilder::new(self.lan_address(), self.lan_port())
            .name(self.node_name())
            .version(self.version())
            .cluster_name(self.cluster_name())
            .data_center(self.data_center_name())
            .local(true);
        if let (Some(address), Some(port)) = (self.wan_address(), self.wan_port()) {
            builder = builder.wan(address, port);
        }
        builder.build()
    }

    // ===================== Cluster Protocol =====================

    /// Number of peers that receive the full value of a published object (default: 2)
    pub fn replication_factor(&self) -> usize {
        self.get_u64("cumulus.replication.factor", 2) as usize
    }

    /// Connection loop interval in milliseconds (default: 5000ms)
    pub fn connection_loop_interval_ms(&self) -> u64 {
        self.get_u64("cumulus.connection.loop-interval", 5000)
    }

    /// Maximum time a node may stay CONNECTING in milliseconds (default: 10000ms)
    pub fn handshake_timeout_ms(&self) -> u64 {
        self.get_u64("cumulus.connection.handshake-timeout", 10000)
    }

    /// Wagon loop interval in milliseconds (default: 1000ms)
    pub fn wagon_timeout_ms(&self) -> u64 {
        self.get_u64("cumulus.wagon.timeout", 1000)
    }

    /// Invoke RPC timeout in milliseconds (default: 5000ms)
    pub fn invoke_timeout_ms(&self) -> u64 {
        self.get_u64("cumulus.invoke.timeout", 5000)
    }

    /// Lock retry interval while WAITING in milliseconds (default: 1000ms)
    pub fn lock_retry_interval_ms(&self) -> u64 {
        self.get_u64("cumulus.lock.retry-interval", 1000)
    }

    /// Whether identification from an unregistered peer registers it (default: true)
    pub fn accept_unknown_peers(&self) -> bool {
        self.config
            .get_bool("cumulus.cluster.accept-unknown-peers")
            .unwrap_or(true)
    }

    /// Node event queue size (default: 1024)
    pub fn event_queue_size(&self) -> usize {
        self.get_u64("cumulus.event.queue-size", 1024) as usize
    }

    // ===================== Member Lookup =====================

    /// Static member list (`cumulus.member.list`, comma separated)
    pub fn member_list(&self) -> Vec<String> {
        self.config
            .get_string("cumulus.member.list")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Path of the cluster member file (default: conf/cluster.conf)
    pub fn member_conf_path(&self) -> String {
        self.config
            .get_string("cumulus.member.conf-path")
            .unwrap_or_else(|_| "conf/cluster.conf".to_string())
    }

    // ===================== Broadcast Discovery =====================

    /// Whether UDP broadcast discovery is enabled (default: false)
    pub fn discovery_enabled(&self) -> bool {
        self.config
            .get_bool("cumulus.discovery.enabled")
            .unwrap_or(false)
    }

    /// UDP discovery port (default: 7947)
    pub fn discovery_port(&self) -> u16 {
        self.config
            .get_int("cumulus.discovery.port")
            .ok()
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(DEFAULT_LAN_PORT + 1)
    }

    /// Discovery ping interval in milliseconds (default: 5000ms)
    pub fn discovery_interval_ms(&self) -> u64 {
        self.get_u64("cumulus.discovery.interval", 5000)
    }
}

/// Typed runtime settings of the cluster protocols
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Number of peers receiving the full value on publish
    pub replication_factor: usize,
    /// Base interval of the connection loop
    pub connection_loop_interval: Duration,
    /// Upper bound of the random delay added to each connection loop cycle
    pub connection_jitter: Duration,
    /// Maximum time a node may stay CONNECTING
    pub handshake_timeout: Duration,
    /// Base interval of the wagon loop
    pub wagon_timeout: Duration,
    /// Bound on a single invoke or lock vote RPC
    pub invoke_timeout: Duration,
    /// Maximum time a WAITING lock sleeps before retrying its vote round
    pub lock_retry_interval: Duration,
    /// Register peers that identify themselves without being known first
    pub accept_unknown_peers: bool,
    /// Node event queue size
    pub event_queue_size: usize,
    /// UDP broadcast discovery settings
    pub discovery: Option<DiscoveryConfig>,
}

/// UDP broadcast discovery settings
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replication_factor: 2,
            connection_loop_interval: Duration::from_secs(5),
            connection_jitter: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            wagon_timeout: Duration::from_secs(1),
            invoke_timeout: Duration::from_secs(5),
            lock_retry_interval: Duration::from_secs(1),
            accept_unknown_peers: true,
            event_queue_size: 1024,
            discovery: None,
        }
    }
}

impl ClusterConfig {
    /// Create a ClusterConfig from application Configuration
    pub fn from_configuration(config: &Configuration) -> Self {
        let discovery = config.discovery_enabled().then(|| DiscoveryConfig {
            port: config.discovery_port(),
            interval: Duration::from_millis(config.discovery_interval_ms()),
        });

        Self {
            replication_factor: config.replication_factor(),
            connection_loop_interval: Duration::from_millis(config.connection_loop_interval_ms()),
            connection_jitter: Duration::from_secs(1),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms()),
            wagon_timeout: Duration::from_millis(config.wagon_timeout_ms()),
            invoke_timeout: Duration::from_millis(config.invoke_timeout_ms()),
            lock_retry_interval: Duration::from_millis(config.lock_retry_interval_ms()),
            accept_unknown_peers: config.accept_unknown_peers(),
            event_queue_size: config.event_queue_size(),
            discovery,
        }
    }
}
