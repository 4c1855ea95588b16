//! Persistent map of every node we have ever contacted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use log::{debug, info, warn};
use rand::seq::SliceRandom;

use shardnet_common::crypto::{Hash, NodeId};

use crate::error::DiscoveryResult;

use super::node::Node;

/// Map from node coordinate to node, guarded by its own mutex.
///
/// Entries are added on first contact and removed only by explicit
/// eviction; the transport, not the database, decides staleness.
pub struct NodeDatabase {
    nodes: Mutex<HashMap<Hash, Node>>,
}

impl NodeDatabase {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or refresh a node. Returns true when the node was not
    /// known before.
    pub fn add(&self, node: Node) -> bool {
        let mut nodes = self.nodes.lock().expect("node database lock poisoned");
        nodes.insert(node.sha(), node).is_none()
    }

    pub fn delete(&self, sha: &Hash) {
        let mut nodes = self.nodes.lock().expect("node database lock poisoned");
        nodes.remove(sha);
    }

    pub fn find_by_id(&self, id: &NodeId) -> Option<Node> {
        let sha = shardnet_common::crypto::hash(id.as_bytes());
        let nodes = self.nodes.lock().expect("node database lock poisoned");
        nodes.get(&sha).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.find_by_id(id).is_some()
    }

    /// Snapshot copy of the whole map.
    pub fn get_copy(&self) -> HashMap<Hash, Node> {
        let nodes = self.nodes.lock().expect("node database lock poisoned");
        nodes.clone()
    }

    /// Uniform sample without replacement, capped at `count`.
    pub fn rand_nodes(&self, count: usize) -> Vec<Node> {
        let nodes = self.nodes.lock().expect("node database lock poisoned");
        let all: Vec<&Node> = nodes.values().collect();
        let mut rng = rand::thread_rng();
        all.choose_multiple(&mut rng, count)
            .map(|n| (*n).clone())
            .collect()
    }

    pub fn rand_node(&self) -> Option<Node> {
        self.rand_nodes(1).into_iter().next()
    }

    pub fn len(&self) -> usize {
        let nodes = self.nodes.lock().expect("node database lock poisoned");
        nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backup every known node to `path` as a JSON list of snode://
    /// strings. Best-effort: failures are for the caller to log.
    pub fn save_to(&self, path: &Path) -> DiscoveryResult<()> {
        let entries: Vec<String> = {
            let nodes = self.nodes.lock().expect("node database lock poisoned");
            nodes.values().map(|n| n.to_string()).collect()
        };

        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;

        info!("backed up {} nodes to {}", entries.len(), path.display());
        Ok(())
    }

    /// Load a backup written by [`save_to`](Self::save_to), skipping
    /// entries that no longer parse.
    pub fn load_from(path: &Path) -> DiscoveryResult<Vec<Node>> {
        let data = std::fs::read_to_string(path)?;
        let entries: Vec<String> = serde_json::from_str(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut nodes = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.parse::<Node>() {
                Ok(node) => nodes.push(node),
                Err(e) => warn!("skipping invalid node backup entry: {}", e),
            }
        }

        debug!("loaded {} nodes from {}", nodes.len(), path.display());
        Ok(nodes)
    }
}

impl Default for NodeDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardnet_common::crypto::NodeId;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_node() -> Node {
        Node::new(
            NodeId::random(),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            8057,
            1,
        )
    }

    #[test]
    fn test_add_find_delete() {
        let db = NodeDatabase::new();
        let node = test_node();

        assert!(db.add(node.clone()));
        assert!(!db.add(node.clone()));
        assert_eq!(db.len(), 1);

        let found = db.find_by_id(&node.id).unwrap();
        assert_eq!(found, node);

        db.delete(&node.sha());
        assert!(db.find_by_id(&node.id).is_none());
        assert!(db.is_empty());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let db = NodeDatabase::new();
        db.add(test_node());

        let copy = db.get_copy();
        db.add(test_node());
        assert_eq!(copy.len(), 1);
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn test_rand_nodes_capped() {
        let db = NodeDatabase::new();
        for _ in 0..8 {
            db.add(test_node());
        }
        assert_eq!(db.rand_nodes(3).len(), 3);
        assert_eq!(db.rand_nodes(100).len(), 8);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let db = NodeDatabase::new();
        let a = test_node();
        let b = test_node();
        db.add(a.clone());
        db.add(b.clone());

        let path = std::env::temp_dir().join(format!("shardnet-nodes-{}.json", std::process::id()));
        db.save_to(&path).unwrap();

        let loaded = NodeDatabase::load_from(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(|n| n.id == a.id));
        assert!(loaded.iter().any(|n| n.id == b.id));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let path = std::env::temp_dir().join("shardnet-does-not-exist.json");
        assert!(NodeDatabase::load_from(&path).is_err());
    }
}
