// Concurrency-safe collection of every known node, connected or not.
// Feeds the dial scheduler with unconnected candidates.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use log::{debug, warn};
use rand::seq::SliceRandom;

use shardnet_common::crypto::NodeId;

use crate::config::{
    MAX_ACTIVE_CONNS_PER_SHARD, MAX_NODES_PER_IP_PER_SHARD, SHARD_COUNT, UNDEFINED_SHARD_NUMBER,
};
use crate::discovery::Node;

struct NodeItem {
    node: Node,
    connected: bool,
}

struct NodeSetInner {
    node_map: HashMap<NodeId, NodeItem>,
    // admission control: nodes per (shard, ip)
    ip_counts: HashMap<(u16, IpAddr), u32>,
}

pub struct NodeSet {
    inner: RwLock<NodeSetInner>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(NodeSetInner {
                node_map: HashMap::new(),
                ip_counts: HashMap::new(),
            }),
        }
    }

    // Add a node if it is not yet known. Nodes without an assigned
    // shard are not dialable and are skipped, as are IPs past their
    // per-shard admission cap.
    pub fn try_add(&self, node: Node) {
        if node.shard == UNDEFINED_SHARD_NUMBER || node.shard > SHARD_COUNT {
            debug!("not tracking node {} with unusable shard", node);
            return;
        }

        let mut inner = self.inner.write().expect("node set lock poisoned");
        if inner.node_map.contains_key(&node.id) {
            return;
        }

        let key = (node.shard, node.ip);
        let count = inner.ip_counts.get(&key).copied().unwrap_or(0);
        if count >= MAX_NODES_PER_IP_PER_SHARD {
            warn!("per-IP node limit reached, not tracking {}", node);
            return;
        }

        inner.ip_counts.insert(key, count + 1);
        inner.node_map.insert(
            node.id,
            NodeItem {
                node,
                connected: false,
            },
        );
    }

    pub fn delete(&self, id: &NodeId) {
        let mut inner = self.inner.write().expect("node set lock poisoned");
        if let Some(item) = inner.node_map.remove(id) {
            let key = (item.node.shard, item.node.ip);
            if let Some(count) = inner.ip_counts.get_mut(&key) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn set_connected(&self, id: &NodeId, connected: bool) {
        let mut inner = self.inner.write().expect("node set lock poisoned");
        if let Some(item) = inner.node_map.get_mut(id) {
            item.connected = connected;
        }
    }

    pub fn is_connected(&self, id: &NodeId) -> bool {
        let inner = self.inner.read().expect("node set lock poisoned");
        inner.node_map.get(id).map(|i| i.connected).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("node set lock poisoned");
        inner.node_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connected_count(&self, shard: u16) -> usize {
        let inner = self.inner.read().expect("node set lock poisoned");
        inner
            .node_map
            .values()
            .filter(|i| i.connected && i.node.shard == shard)
            .count()
    }

    // One random unconnected candidate per shard, skipping shards that
    // already carry enough active connections.
    pub fn rand_unconnected(&self) -> Vec<Node> {
        let inner = self.inner.read().expect("node set lock poisoned");

        let mut per_shard: HashMap<u16, Vec<&Node>> = HashMap::new();
        let mut connected_counts: HashMap<u16, usize> = HashMap::new();
        for item in inner.node_map.values() {
            if item.connected {
                *connected_counts.entry(item.node.shard).or_insert(0) += 1;
            } else {
                per_shard.entry(item.node.shard).or_default().push(&item.node);
            }
        }

        let mut rng = rand::thread_rng();
        let mut result = Vec::new();
        for shard in 1..=SHARD_COUNT {
            let connected = connected_counts.get(&shard).copied().unwrap_or(0);
            if connected >= MAX_ACTIVE_CONNS_PER_SHARD / 2 {
                continue;
            }
            if let Some(candidates) = per_shard.get(&shard) {
                if let Some(node) = candidates.choose(&mut rng) {
                    result.push((*node).clone());
                }
            }
        }

        result
    }
}

impl Default for NodeSet {
    fn default() -> Self {
        Self::new()
    }
}
