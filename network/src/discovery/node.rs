//! Node value type and the snode:// textual form.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::OnceLock;

use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer as SerdeSerializer};

use shardnet_common::crypto::{hash, Hash, NodeId};

use crate::error::DiscoveryError;

/// URL scheme prefix of the textual node form.
pub const NODE_URL_SCHEME: &str = "snode://";

/// A discovered network node.
///
/// Immutable once constructed. Identity is the 64-byte `id`; the
/// Kademlia coordinate is its Keccak-256 digest, computed lazily via
/// [`Node::sha`].
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub ip: IpAddr,
    pub udp_port: u16,
    /// TCP listen port; 0 means "same as the UDP port".
    pub tcp_port: u16,
    pub shard: u16,
    sha: OnceLock<Hash>,
}

impl Node {
    pub fn new(id: NodeId, ip: IpAddr, udp_port: u16, shard: u16) -> Self {
        Self {
            id,
            ip,
            udp_port,
            tcp_port: 0,
            shard,
            sha: OnceLock::new(),
        }
    }

    /// Build a node from the address a datagram arrived from.
    pub fn with_addr(id: NodeId, addr: SocketAddr, shard: u16) -> Self {
        Self::new(id, addr.ip(), addr.port(), shard)
    }

    /// The Kademlia coordinate of this node.
    pub fn sha(&self) -> Hash {
        *self.sha.get_or_init(|| hash(self.id.as_bytes()))
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        let port = if self.tcp_port == 0 {
            self.udp_port
        } else {
            self.tcp_port
        };
        SocketAddr::new(self.ip, port)
    }
}

// Entity equality is by id; address fields participate so that a
// re-discovered node with a new address compares different.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.ip == other.ip
            && self.udp_port == other.udp_port
            && self.tcp_port == other.tcp_port
            && self.shard == other.shard
    }
}

impl Eq for Node {}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}@{}[{}]",
            NODE_URL_SCHEME,
            self.id.to_hex(),
            self.udp_addr(),
            self.shard
        )
    }
}

impl FromStr for Node {
    type Err = DiscoveryError;

    /// Parse the canonical textual form:
    /// `snode://<node_id_hex>@<ip>:<port>[<shard>]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(NODE_URL_SCHEME).ok_or_else(|| {
            DiscoveryError::InvalidNode(format!("node string must start with {}", NODE_URL_SCHEME))
        })?;

        let (id_hex, addr_part) = rest.split_once('@').ok_or_else(|| {
            DiscoveryError::InvalidNode("missing '@' between node id and address".to_owned())
        })?;

        let id: NodeId = id_hex
            .parse()
            .map_err(|e| DiscoveryError::InvalidNode(format!("invalid node id: {}", e)))?;

        // the shard suffix is the last bracketed group, so an IPv6
        // address like [::1]:8057 stays intact
        let (addr_str, shard_part) = addr_part.rsplit_once('[').ok_or_else(|| {
            DiscoveryError::InvalidNode("missing [shard] suffix".to_owned())
        })?;

        let shard_str = shard_part.strip_suffix(']').ok_or_else(|| {
            DiscoveryError::InvalidNode("unterminated [shard] suffix".to_owned())
        })?;

        let shard: u16 = shard_str
            .parse()
            .map_err(|_| DiscoveryError::InvalidNode(format!("invalid shard '{}'", shard_str)))?;

        let addr: SocketAddr = addr_str
            .parse()
            .map_err(|e| DiscoveryError::InvalidNode(format!("invalid address '{}': {}", addr_str, e)))?;

        Ok(Self::with_addr(id, addr, shard))
    }
}

impl Serialize for Node {
    fn serialize<S: SerdeSerializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
