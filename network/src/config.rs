//! Configuration surface and protocol constants for the network core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ===== Shards =====

/// Number of shards in the network.
pub const SHARD_COUNT: u16 = 4;

/// Shard number meaning "not assigned to any shard".
pub const UNDEFINED_SHARD_NUMBER: u16 = 0;

// ===== Discovery =====

/// Version of the discovery wire protocol. Pings carrying another
/// version are dropped without a reply.
pub const DISCOVERY_PROTOCOL_VERSION: u8 = 1;

/// Kademlia bucket size (k parameter).
pub const BUCKET_SIZE: usize = 16;

/// Bits of the Kademlia coordinate (Keccak-256 digest).
pub const HASH_BITS: usize = shardnet_common::crypto::HASH_SIZE * 8;

/// Number of general buckets, one per log-distance class plus one for
/// distance zero.
pub const N_BUCKETS: usize = HASH_BITS + 1;

/// Kademlia concurrency factor for lookups.
pub const ALPHA: usize = 3;

/// Maximum nodes returned in a neighbors / shard-node reply.
pub const RESPONSE_NODE_COUNT: usize = 10;

/// Maximum UDP datagram size we send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 1472;

/// How long to wait for a reply to a discovery request.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

/// Interval between ping rounds over the known node set.
pub const PING_PONG_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between find-node / find-shard-node rounds.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(35);

/// Interval between pending-reply expiry sweeps.
pub const PENDING_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// A node is removed from table and database after this many
/// consecutive ping timeouts.
pub const TIMEOUT_COUNT_TO_DELETE: u32 = 8;

/// Maximum concurrent datagram handlers, packets beyond it are dropped.
pub const MAX_CONCURRENT_HANDLERS: usize = 64;

/// Maximum tracked outstanding discovery requests.
pub const MAX_PENDING_REQUESTS: usize = 256;

/// Interval between node database backups to disk.
pub const NODES_BACKUP_INTERVAL: Duration = Duration::from_secs(3600);

// ===== Peer connections =====

/// First message code available to sub-protocols; codes below it are
/// reserved control codes.
pub const BASE_PROTOCOL_CODE: u16 = 16;

/// Maximum framed message payload size.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Payloads larger than this are compressed before framing.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Interval between keepalive pings on a peer connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Maximum time allowed for reading a complete frame.
pub const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum time allowed for writing a complete frame.
pub const FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum time allowed for the whole handshake exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum time allowed for an outbound TCP connect.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between dial scheduler rounds.
pub const DIAL_SCHEDULER_INTERVAL: Duration = Duration::from_secs(10);

/// Default maximum number of connected peers.
pub const DEFAULT_MAX_PEERS: usize = 500;

/// Default maximum number of concurrently handshaking inbound
/// connections.
pub const DEFAULT_MAX_PENDING_PEERS: usize = 50;

/// Hard capacity of the peer set; overflow evicts an arbitrary entry.
pub const MAX_PEER_CONNECTED: usize = 1024;

/// Capacity of each sub-protocol notification channel.
pub const PROTOCOL_CHANNEL_SIZE: usize = 256;

/// Maximum known nodes admitted per IP address per shard.
pub const MAX_NODES_PER_IP_PER_SHARD: u32 = 10;

/// Target number of active connections per shard; the dial scheduler
/// stops pulling candidates for a shard past half of it.
pub const MAX_ACTIVE_CONNS_PER_SHARD: usize = 32;

/// Default listen port for both TCP peers and UDP discovery.
pub const DEFAULT_LISTEN_PORT: u16 = 8057;

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", DEFAULT_LISTEN_PORT)
}

fn default_network_id() -> u64 {
    1
}

fn default_shard() -> u16 {
    1
}

fn default_max_peers() -> usize {
    DEFAULT_MAX_PEERS
}

fn default_max_pending_peers() -> usize {
    DEFAULT_MAX_PENDING_PEERS
}

/// Configuration consumed by the network core.
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to listen on for TCP peers and UDP discovery.
    #[clap(name = "p2p-bind-address", long, default_value_t = default_listen_addr())]
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Network identifier; peers on another network are rejected at
    /// handshake.
    #[clap(name = "network-id", long, default_value_t = default_network_id())]
    #[serde(default = "default_network_id")]
    pub network_id: u64,

    /// Shard this node serves.
    #[clap(name = "shard", long, default_value_t = default_shard())]
    #[serde(default = "default_shard")]
    pub shard: u16,

    /// Node identifier (128 hex characters). A random identity is
    /// generated when omitted.
    #[clap(name = "node-id", long)]
    #[serde(default)]
    pub node_id: Option<String>,

    /// Static nodes, dialed and kept connected.
    ///
    /// Format: snode://<node_id_hex>@<ip>:<port>[<shard>]
    #[clap(name = "static-node", long)]
    #[serde(default)]
    pub static_nodes: Vec<String>,

    /// Trust nodes used to seed the discovery database.
    #[clap(name = "trust-node", long)]
    #[serde(default)]
    pub trust_nodes: Vec<String>,

    /// Bootstrap node pinged once at startup.
    #[clap(name = "bootstrap-node", long)]
    #[serde(default)]
    pub bootstrap: Option<String>,

    /// Maximum number of connected peers.
    #[clap(name = "max-peers", long, default_value_t = default_max_peers())]
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Maximum number of concurrently handshaking inbound connections.
    #[clap(name = "max-pending-peers", long, default_value_t = default_max_pending_peers())]
    #[serde(default = "default_max_pending_peers")]
    pub max_pending_peers: usize,

    /// Path of the node database backup file. Disabled when omitted.
    #[clap(name = "node-db-path", long)]
    #[serde(default)]
    pub node_db_path: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            network_id: default_network_id(),
            shard: default_shard(),
            node_id: None,
            static_nodes: Vec::new(),
            trust_nodes: Vec::new(),
            bootstrap: None,
            max_peers: DEFAULT_MAX_PEERS,
            max_pending_peers: DEFAULT_MAX_PENDING_PEERS,
            node_db_path: None,
        }
    }
}

/// Check a shard number fits the configured shard count. Shard 0 is a
/// valid "undefined" tag for discovery but not for peer connections.
pub fn is_shard_valid(shard: u16) -> bool {
    shard <= SHARD_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.network_id, 1);
        assert_eq!(config.shard, 1);
        assert_eq!(config.max_peers, DEFAULT_MAX_PEERS);
        assert!(config.static_nodes.is_empty());
        assert!(config.node_id.is_none());
    }

    #[test]
    fn test_shard_validity() {
        assert!(is_shard_valid(UNDEFINED_SHARD_NUMBER));
        assert!(is_shard_valid(SHARD_COUNT));
        assert!(!is_shard_valid(SHARD_COUNT + 1));
    }
}
