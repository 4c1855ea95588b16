//! Fixed-capacity node bucket with FIFO eviction.

use log::debug;
use rand::seq::SliceRandom;

use shardnet_common::crypto::Hash;

use crate::config::BUCKET_SIZE;

use super::node::Node;

/// An ordered list of at most [`BUCKET_SIZE`] nodes.
///
/// Insertion order is kept, most recently added at the tail. A full
/// bucket drops its oldest entry to admit a new one. Re-inserting a
/// node that is already present is a no-op, not a promotion.
///
/// Not synchronized; the owning [`Table`](super::Table) is guarded by
/// the transport's mutex.
#[derive(Debug, Default)]
pub struct Bucket {
    peers: Vec<Node>,
}

impl Bucket {
    pub fn new() -> Self {
        Self { peers: Vec::new() }
    }

    /// Add a node; drops the oldest entry when full. Duplicate ids are
    /// left untouched.
    pub fn add_node(&mut self, node: Node) {
        if self.peers.iter().any(|n| n.id == node.id) {
            return;
        }

        if self.peers.len() >= BUCKET_SIZE {
            self.peers.remove(0);
        }
        self.peers.push(node);
    }

    /// Remove the node whose coordinate matches `sha`; no-op if absent.
    pub fn delete_node(&mut self, sha: &Hash) {
        match self.peers.iter().position(|n| n.sha() == *sha) {
            Some(index) => {
                let node = self.peers.remove(index);
                debug!("removed node {} from bucket", node.id);
            }
            None => {
                debug!("node to delete not found in bucket");
            }
        }
    }

    /// Uniform sample without replacement, capped at `count`.
    pub fn rand_nodes(&self, count: usize) -> Vec<Node> {
        let mut rng = rand::thread_rng();
        self.peers
            .choose_multiple(&mut rng, count)
            .cloned()
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<&Node> {
        self.peers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
