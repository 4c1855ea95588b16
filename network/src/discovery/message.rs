//! Wire messages of the discovery protocol.
//!
//! A datagram is `[1-byte message type][encoded payload]`; the payload
//! layout is the declaration order of the message struct fields.

use std::net::IpAddr;

use shardnet_common::crypto::{Hash, NodeId};
use shardnet_common::serializer::{Reader, ReaderError, Serializer, Writer};

use crate::config::RESPONSE_NODE_COUNT;

use super::node::Node;

/// Message type identifiers. One canonical enumeration; the type byte
/// on the wire is exactly one of these.
pub mod message_type {
    pub const PING: u8 = 1;
    pub const PONG: u8 = 2;
    pub const FIND_NODE: u8 = 3;
    pub const NEIGHBORS: u8 = 4;
    pub const FIND_SHARD_NODE: u8 = 5;
    pub const SHARD_NODE: u8 = 6;
}

/// Compact node representation carried inside neighbor lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcNode {
    pub id: NodeId,
    pub ip: IpAddr,
    pub udp_port: u16,
    pub shard: u16,
}

impl RpcNode {
    pub fn to_node(&self) -> Node {
        Node::new(self.id, self.ip, self.udp_port, self.shard)
    }
}

impl From<&Node> for RpcNode {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id,
            ip: node.ip,
            udp_port: node.udp_port,
            shard: node.shard,
        }
    }
}

impl Serializer for RpcNode {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let id = NodeId::read(reader)?;

        let ip = match reader.read_u8()? {
            4 => {
                let bytes = reader.read_bytes(4)?;
                let mut octets = [0u8; 4];
                octets.copy_from_slice(bytes);
                IpAddr::from(octets)
            }
            6 => {
                let bytes = reader.read_bytes(16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                IpAddr::from(octets)
            }
            _ => return Err(ReaderError::InvalidValue),
        };

        let udp_port = reader.read_u16()?;
        let shard = reader.read_u16()?;

        Ok(Self {
            id,
            ip,
            udp_port,
            shard,
        })
    }

    fn write(&self, writer: &mut Writer) {
        self.id.write(writer);

        match self.ip {
            IpAddr::V4(ip) => {
                writer.write_u8(4);
                writer.write_bytes(&ip.octets());
            }
            IpAddr::V6(ip) => {
                writer.write_u8(6);
                writer.write_bytes(&ip.octets());
            }
        }

        writer.write_u16(self.udp_port);
        writer.write_u16(self.shard);
    }

    fn size(&self) -> usize {
        self.id.size() + 1 + if self.ip.is_ipv4() { 4 } else { 16 } + 2 + 2
    }
}

/// Liveness check; carries the sender's identity and shard.
#[derive(Debug, Clone)]
pub struct Ping {
    pub version: u8,
    pub id: NodeId,
    pub shard: u16,
}

impl Serializer for Ping {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let version = reader.read_u8()?;
        let id = NodeId::read(reader)?;
        let shard = reader.read_u16()?;
        Ok(Self { version, id, shard })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.version);
        self.id.write(writer);
        writer.write_u16(self.shard);
    }

    fn size(&self) -> usize {
        1 + self.id.size() + 2
    }
}

/// Response to a ping.
#[derive(Debug, Clone)]
pub struct Pong {
    pub id: NodeId,
    pub shard: u16,
}

impl Serializer for Pong {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let id = NodeId::read(reader)?;
        let shard = reader.read_u16()?;
        Ok(Self { id, shard })
    }

    fn write(&self, writer: &mut Writer) {
        self.id.write(writer);
        writer.write_u16(self.shard);
    }

    fn size(&self) -> usize {
        self.id.size() + 2
    }
}

/// Request for nodes close to a target coordinate.
#[derive(Debug, Clone)]
pub struct FindNode {
    pub id: NodeId,
    pub target: Hash,
}

impl Serializer for FindNode {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let id = NodeId::read(reader)?;
        let target = Hash::read(reader)?;
        Ok(Self { id, target })
    }

    fn write(&self, writer: &mut Writer) {
        self.id.write(writer);
        self.target.write(writer);
    }

    fn size(&self) -> usize {
        self.id.size() + self.target.size()
    }
}

/// Response to a find-node request.
#[derive(Debug, Clone)]
pub struct Neighbors {
    pub id: NodeId,
    pub nodes: Vec<RpcNode>,
}

impl Serializer for Neighbors {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let id = NodeId::read(reader)?;
        let nodes = read_node_list(reader)?;
        Ok(Self { id, nodes })
    }

    fn write(&self, writer: &mut Writer) {
        self.id.write(writer);
        write_node_list(&self.nodes, writer);
    }

    fn size(&self) -> usize {
        self.id.size() + node_list_size(&self.nodes)
    }
}

/// Request for nodes of a specific shard.
#[derive(Debug, Clone)]
pub struct FindShardNode {
    pub id: NodeId,
    pub shard: u16,
}

impl Serializer for FindShardNode {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let id = NodeId::read(reader)?;
        let shard = reader.read_u16()?;
        Ok(Self { id, shard })
    }

    fn write(&self, writer: &mut Writer) {
        self.id.write(writer);
        writer.write_u16(self.shard);
    }

    fn size(&self) -> usize {
        self.id.size() + 2
    }
}

/// Response to a find-shard-node request.
#[derive(Debug, Clone)]
pub struct ShardNode {
    pub id: NodeId,
    pub shard: u16,
    pub nodes: Vec<RpcNode>,
}

impl Serializer for ShardNode {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let id = NodeId::read(reader)?;
        let shard = reader.read_u16()?;
        let nodes = read_node_list(reader)?;
        Ok(Self { id, shard, nodes })
    }

    fn write(&self, writer: &mut Writer) {
        self.id.write(writer);
        writer.write_u16(self.shard);
        write_node_list(&self.nodes, writer);
    }

    fn size(&self) -> usize {
        self.id.size() + 2 + node_list_size(&self.nodes)
    }
}

// Node lists are length-prefixed and capped so a hostile datagram
// cannot make us allocate unbounded memory.
fn read_node_list(reader: &mut Reader) -> Result<Vec<RpcNode>, ReaderError> {
    let count = reader.read_u8()? as usize;
    if count > RESPONSE_NODE_COUNT {
        return Err(ReaderError::InvalidSize);
    }

    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        nodes.push(RpcNode::read(reader)?);
    }
    Ok(nodes)
}

fn write_node_list(nodes: &[RpcNode], writer: &mut Writer) {
    writer.write_u8(nodes.len() as u8);
    for node in nodes {
        node.write(writer);
    }
}

fn node_list_size(nodes: &[RpcNode]) -> usize {
    1 + nodes.iter().map(|n| n.size()).sum::<usize>()
}

/// Tagged union over the discovery messages, one decode function per
/// discriminant.
#[derive(Debug, Clone)]
pub enum DiscoveryMessage {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
    FindShardNode(FindShardNode),
    ShardNode(ShardNode),
}

impl DiscoveryMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            DiscoveryMessage::Ping(_) => message_type::PING,
            DiscoveryMessage::Pong(_) => message_type::PONG,
            DiscoveryMessage::FindNode(_) => message_type::FIND_NODE,
            DiscoveryMessage::Neighbors(_) => message_type::NEIGHBORS,
            DiscoveryMessage::FindShardNode(_) => message_type::FIND_SHARD_NODE,
            DiscoveryMessage::ShardNode(_) => message_type::SHARD_NODE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryMessage::Ping(_) => "ping",
            DiscoveryMessage::Pong(_) => "pong",
            DiscoveryMessage::FindNode(_) => "find_node",
            DiscoveryMessage::Neighbors(_) => "neighbors",
            DiscoveryMessage::FindShardNode(_) => "find_shard_node",
            DiscoveryMessage::ShardNode(_) => "shard_node",
        }
    }
}

impl Serializer for DiscoveryMessage {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let msg_type = reader.read_u8()?;
        match msg_type {
            message_type::PING => Ok(DiscoveryMessage::Ping(Ping::read(reader)?)),
            message_type::PONG => Ok(DiscoveryMessage::Pong(Pong::read(reader)?)),
            message_type::FIND_NODE => Ok(DiscoveryMessage::FindNode(FindNode::read(reader)?)),
            message_type::NEIGHBORS => Ok(DiscoveryMessage::Neighbors(Neighbors::read(reader)?)),
            message_type::FIND_SHARD_NODE => Ok(DiscoveryMessage::FindShardNode(
                FindShardNode::read(reader)?,
            )),
            message_type::SHARD_NODE => Ok(DiscoveryMessage::ShardNode(ShardNode::read(reader)?)),
            _ => Err(ReaderError::InvalidValue),
        }
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.message_type());
        match self {
            DiscoveryMessage::Ping(m) => m.write(writer),
            DiscoveryMessage::Pong(m) => m.write(writer),
            DiscoveryMessage::FindNode(m) => m.write(writer),
            DiscoveryMessage::Neighbors(m) => m.write(writer),
            DiscoveryMessage::FindShardNode(m) => m.write(writer),
            DiscoveryMessage::ShardNode(m) => m.write(writer),
        }
    }

    fn size(&self) -> usize {
        1 + match self {
            DiscoveryMessage::Ping(m) => m.size(),
            DiscoveryMessage::Pong(m) => m.size(),
            DiscoveryMessage::FindNode(m) => m.size(),
            DiscoveryMessage::Neighbors(m) => m.size(),
            DiscoveryMessage::FindShardNode(m) => m.size(),
            DiscoveryMessage::ShardNode(m) => m.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DISCOVERY_PROTOCOL_VERSION;
    use shardnet_common::crypto::hash;
    use std::net::Ipv4Addr;

    fn test_rpc_node() -> RpcNode {
        RpcNode {
            id: NodeId::random(),
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            udp_port: 8057,
            shard: 3,
        }
    }

    #[test]
    fn test_rpc_node_roundtrip() {
        let node = test_rpc_node();
        let decoded = RpcNode::from_bytes(&node.to_bytes()).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(node.to_bytes().len(), node.size());
    }

    #[test]
    fn test_rpc_node_roundtrip_ipv6() {
        let mut node = test_rpc_node();
        node.ip = "::1".parse().unwrap();
        let decoded = RpcNode::from_bytes(&node.to_bytes()).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn test_ping_roundtrip() {
        let ping = Ping {
            version: DISCOVERY_PROTOCOL_VERSION,
            id: NodeId::random(),
            shard: 2,
        };
        let msg = DiscoveryMessage::Ping(ping.clone());
        assert_eq!(msg.message_type(), message_type::PING);

        let decoded = DiscoveryMessage::from_bytes(&msg.to_bytes()).unwrap();
        match decoded {
            DiscoveryMessage::Ping(p) => {
                assert_eq!(p.version, ping.version);
                assert_eq!(p.id, ping.id);
                assert_eq!(p.shard, ping.shard);
            }
            other => panic!("expected ping, got {}", other.name()),
        }
    }

    #[test]
    fn test_find_node_roundtrip() {
        let msg = DiscoveryMessage::FindNode(FindNode {
            id: NodeId::random(),
            target: hash(b"target"),
        });
        let decoded = DiscoveryMessage::from_bytes(&msg.to_bytes()).unwrap();
        match decoded {
            DiscoveryMessage::FindNode(m) => assert_eq!(m.target, hash(b"target")),
            other => panic!("expected find_node, got {}", other.name()),
        }
    }

    #[test]
    fn test_neighbors_roundtrip() {
        let nodes: Vec<RpcNode> = (0..5).map(|_| test_rpc_node()).collect();
        let msg = DiscoveryMessage::Neighbors(Neighbors {
            id: NodeId::random(),
            nodes: nodes.clone(),
        });
        let decoded = DiscoveryMessage::from_bytes(&msg.to_bytes()).unwrap();
        match decoded {
            DiscoveryMessage::Neighbors(m) => assert_eq!(m.nodes, nodes),
            other => panic!("expected neighbors, got {}", other.name()),
        }
    }

    #[test]
    fn test_shard_node_roundtrip() {
        let nodes: Vec<RpcNode> = (0..3).map(|_| test_rpc_node()).collect();
        let msg = DiscoveryMessage::ShardNode(ShardNode {
            id: NodeId::random(),
            shard: 2,
            nodes: nodes.clone(),
        });
        let decoded = DiscoveryMessage::from_bytes(&msg.to_bytes()).unwrap();
        match decoded {
            DiscoveryMessage::ShardNode(m) => {
                assert_eq!(m.shard, 2);
                assert_eq!(m.nodes, nodes);
            }
            other => panic!("expected shard_node, got {}", other.name()),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(DiscoveryMessage::from_bytes(&[0x7f, 0, 0]).is_err());
        assert!(DiscoveryMessage::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_oversized_node_list_rejected() {
        let mut bytes = Vec::new();
        let mut writer = Writer::new(&mut bytes);
        writer.write_u8(message_type::NEIGHBORS);
        NodeId::random().write(&mut writer);
        writer.write_u8(RESPONSE_NODE_COUNT as u8 + 1);

        assert!(DiscoveryMessage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let msg = DiscoveryMessage::Pong(Pong {
            id: NodeId::random(),
            shard: 1,
        });
        let bytes = msg.to_bytes();
        assert!(DiscoveryMessage::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
