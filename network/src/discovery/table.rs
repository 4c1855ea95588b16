//! Distance-indexed routing table with shard-indexed side buckets.

use log::debug;
use rand::seq::SliceRandom;

use shardnet_common::crypto::Hash;

use crate::config::{is_shard_valid, N_BUCKETS, RESPONSE_NODE_COUNT, SHARD_COUNT};

use super::bucket::Bucket;
use super::distance::{dist_cmp, log_dist};
use super::node::Node;

/// Routing table of the local node.
///
/// Every known node sits in exactly one general bucket, indexed by the
/// XOR log-distance between its coordinate and ours. Nodes with an
/// assigned shard (>= 1) are additionally indexed by their shard
/// number for shard-targeted discovery.
///
/// The table is not internally synchronized: the UDP transport owns a
/// single mutex around all access.
pub struct Table {
    buckets: Vec<Bucket>,
    // index 0 stays empty: undefined-shard nodes only live in the
    // general buckets
    shard_buckets: Vec<Bucket>,
    self_node: Node,
}

impl Table {
    pub fn new(self_node: Node) -> Self {
        let buckets = (0..N_BUCKETS).map(|_| Bucket::new()).collect();
        let shard_buckets = (0..=SHARD_COUNT as usize).map(|_| Bucket::new()).collect();

        Self {
            buckets,
            shard_buckets,
            self_node,
        }
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    /// Insert a node into its general bucket and, when its shard is
    /// assigned, into the matching shard bucket. Idempotent on
    /// duplicate ids; the local node is never inserted.
    pub fn add_node(&mut self, node: Node) {
        if node.id == self.self_node.id {
            return;
        }

        if !is_shard_valid(node.shard) {
            debug!(
                "dropping node with invalid shard {} (shard count is {})",
                node.shard, SHARD_COUNT
            );
            return;
        }

        let dist = log_dist(&self.self_node.sha(), &node.sha());
        self.buckets[dist].add_node(node.clone());

        if node.shard >= 1 {
            self.shard_buckets[node.shard as usize].add_node(node);
        }
    }

    /// Remove a node from both its general and shard bucket; no-op if
    /// absent.
    pub fn delete_node(&mut self, node: &Node) {
        if !is_shard_valid(node.shard) {
            return;
        }

        let sha = node.sha();
        let dist = log_dist(&self.self_node.sha(), &sha);
        self.buckets[dist].delete_node(&sha);

        if node.shard >= 1 {
            self.shard_buckets[node.shard as usize].delete_node(&sha);
        }
    }

    /// Approximate one-hop neighbor set for `target`: nodes of our own
    /// shard bucket that are strictly closer to the target than we
    /// are, sorted by distance and capped at [`RESPONSE_NODE_COUNT`].
    ///
    /// This is deliberately not a full k-closest lookup.
    pub fn find_node_with_target(&self, target: &Hash) -> Vec<Node> {
        let self_sha = self.self_node.sha();
        let bucket = &self.shard_buckets[self.self_node.shard as usize];

        let mut result = NodesByDistance::new(*target, RESPONSE_NODE_COUNT);
        for node in bucket.iter() {
            if dist_cmp(target, &node.sha(), &self_sha) == std::cmp::Ordering::Less {
                result.push(node.clone());
            }
        }

        result.entries
    }

    /// Closest known nodes to `target` across the general buckets, used
    /// to pick recipients for lookup requests.
    pub fn find_closest(&self, target: &Hash, count: usize) -> Vec<Node> {
        let mut result = NodesByDistance::new(*target, count);
        for bucket in &self.buckets {
            for node in bucket.iter() {
                result.push(node.clone());
            }
        }
        result.entries
    }

    /// Random sample of one shard's bucket.
    pub fn find_shard_nodes(&self, shard: u16, count: usize) -> Vec<Node> {
        if !is_shard_valid(shard) {
            return Vec::new();
        }
        self.shard_buckets[shard as usize].rand_nodes(count)
    }

    /// Uniform sample without replacement across all populated shard
    /// buckets, capped at `count`.
    pub fn get_rand_nodes(&self, count: usize) -> Vec<Node> {
        let mut all: Vec<Node> = self
            .shard_buckets
            .iter()
            .flat_map(|b| b.iter().cloned())
            .collect();

        let mut rng = rand::thread_rng();
        all.shuffle(&mut rng);
        all.truncate(count);
        all
    }

    pub fn shard_bucket_len(&self, shard: u16) -> usize {
        if !is_shard_valid(shard) {
            return 0;
        }
        self.shard_buckets[shard as usize].len()
    }

    /// A random member of one shard bucket.
    pub fn rand_shard_node(&self, shard: u16) -> Option<Node> {
        self.find_shard_nodes(shard, 1).into_iter().next()
    }

    /// Total entries across general and shard buckets.
    pub fn count(&self) -> usize {
        let general: usize = self.buckets.iter().map(|b| b.len()).sum();
        let sharded: usize = self.shard_buckets.iter().map(|b| b.len()).sum();
        general + sharded
    }
}

/// Nodes ordered by distance to a target, keeping at most `max_elems`.
struct NodesByDistance {
    target: Hash,
    max_elems: usize,
    entries: Vec<Node>,
}

impl NodesByDistance {
    fn new(target: Hash, max_elems: usize) -> Self {
        Self {
            target,
            max_elems,
            entries: Vec::new(),
        }
    }

    fn push(&mut self, node: Node) {
        let sha = node.sha();
        let index = self
            .entries
            .partition_point(|n| dist_cmp(&self.target, &n.sha(), &sha) != std::cmp::Ordering::Greater);

        if self.entries.len() < self.max_elems {
            self.entries.insert(index, node);
        } else if index < self.entries.len() {
            self.entries.pop();
            self.entries.insert(index, node);
        }
        // farther away than everything we already keep: dropped
    }
}
