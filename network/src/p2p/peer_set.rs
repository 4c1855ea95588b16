// Concurrency-safe collection of connected peers, indexed globally and
// per shard.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::warn;
use rand::Rng;

use shardnet_common::crypto::NodeId;

use crate::config::{MAX_PEER_CONNECTED, SHARD_COUNT};

use super::peer::Peer;

struct PeerSetInner {
    peer_map: HashMap<NodeId, Arc<Peer>>,
    // mirrors peer_map, partitioned by shard; every add/remove updates
    // both
    shard_peer_map: HashMap<u16, HashMap<NodeId, Arc<Peer>>>,
}

pub struct PeerSet {
    inner: RwLock<PeerSetInner>,
}

impl PeerSet {
    pub fn new() -> Self {
        let mut shard_peer_map = HashMap::new();
        for shard in 1..=SHARD_COUNT {
            shard_peer_map.insert(shard, HashMap::new());
        }

        Self {
            inner: RwLock::new(PeerSetInner {
                peer_map: HashMap::new(),
                shard_peer_map,
            }),
        }
    }

    // Add a peer to both indexes. When the set is at capacity an
    // arbitrary existing peer is evicted and returned so the caller can
    // disconnect it; best-effort, not LRU.
    pub fn add(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        self.add_with_capacity(peer, MAX_PEER_CONNECTED)
    }

    fn add_with_capacity(&self, peer: Arc<Peer>, capacity: usize) -> Option<Arc<Peer>> {
        let mut inner = self.inner.write().expect("peer set lock poisoned");

        let evicted = if inner.peer_map.len() >= capacity {
            let victim_id = inner.peer_map.keys().next().copied();
            victim_id.and_then(|id| Self::remove_locked(&mut inner, &id))
        } else {
            None
        };

        if let Some(victim) = &evicted {
            warn!("peer set full, evicting {}", victim.node());
        }

        let shard = peer.shard();
        inner.peer_map.insert(peer.node().id, peer.clone());
        inner
            .shard_peer_map
            .entry(shard)
            .or_default()
            .insert(peer.node().id, peer);

        evicted
    }

    pub fn remove(&self, id: &NodeId) -> Option<Arc<Peer>> {
        let mut inner = self.inner.write().expect("peer set lock poisoned");
        Self::remove_locked(&mut inner, id)
    }

    fn remove_locked(inner: &mut PeerSetInner, id: &NodeId) -> Option<Arc<Peer>> {
        let peer = inner.peer_map.remove(id)?;
        if let Some(shard_map) = inner.shard_peer_map.get_mut(&peer.shard()) {
            shard_map.remove(id);
        }
        Some(peer)
    }

    pub fn find(&self, id: &NodeId) -> Option<Arc<Peer>> {
        let inner = self.inner.read().expect("peer set lock poisoned");
        inner.peer_map.get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.find(id).is_some()
    }

    pub fn count(&self) -> usize {
        let inner = self.inner.read().expect("peer set lock poisoned");
        inner.peer_map.len()
    }

    pub fn count_shard(&self, shard: u16) -> usize {
        let inner = self.inner.read().expect("peer set lock poisoned");
        inner
            .shard_peer_map
            .get(&shard)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn rand_peer(&self) -> Option<Arc<Peer>> {
        let inner = self.inner.read().expect("peer set lock poisoned");
        if inner.peer_map.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..inner.peer_map.len());
        inner.peer_map.values().nth(index).cloned()
    }

    pub fn get_peers(&self) -> Vec<Arc<Peer>> {
        let inner = self.inner.read().expect("peer set lock poisoned");
        inner.peer_map.values().cloned().collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Peer>)) {
        let peers = self.get_peers();
        for peer in &peers {
            f(peer);
        }
    }

    // Sum of the shard index sizes; equals count() by invariant.
    pub fn shard_total(&self) -> usize {
        let inner = self.inner.read().expect("peer set lock poisoned");
        inner.shard_peer_map.values().map(|m| m.len()).sum()
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Node;
    use crate::p2p::connection::Connection;
    use shardnet_common::crypto::NodeId;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::{TcpListener, TcpStream};

    async fn test_peer(shard: u16) -> Arc<Peer> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr);
        let (accepted, dialed) = tokio::join!(listener.accept(), dialed);
        // keep only one end, the other is dropped with the listener
        drop(accepted);

        let node = Node::new(
            NodeId::random(),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            8057,
            shard,
        );
        Peer::new(node, Connection::new(dialed.unwrap(), true).unwrap(), &[])
    }

    #[tokio::test]
    async fn test_global_and_shard_index_stay_in_sync() {
        let set = PeerSet::new();
        let mut peers = Vec::new();
        for i in 0..8 {
            let peer = test_peer((i % SHARD_COUNT) + 1).await;
            set.add(peer.clone());
            peers.push(peer);
        }

        assert_eq!(set.count(), 8);
        assert_eq!(set.count(), set.shard_total());

        for peer in peers.iter().take(4) {
            set.remove(&peer.node().id);
        }
        assert_eq!(set.count(), 4);
        assert_eq!(set.count(), set.shard_total());

        // every remaining peer sits in exactly one shard bucket
        for peer in peers.iter().skip(4) {
            let inner = set.inner.read().unwrap();
            let holding: usize = inner
                .shard_peer_map
                .values()
                .filter(|m| m.contains_key(&peer.node().id))
                .count();
            assert_eq!(holding, 1);
        }
    }

    #[tokio::test]
    async fn test_find_and_remove() {
        let set = PeerSet::new();
        let peer = test_peer(1).await;
        set.add(peer.clone());

        assert!(set.contains(&peer.node().id));
        let removed = set.remove(&peer.node().id).unwrap();
        assert_eq!(removed.node().id, peer.node().id);
        assert!(!set.contains(&peer.node().id));
        assert!(set.remove(&peer.node().id).is_none());
    }

    #[tokio::test]
    async fn test_overflow_evicts_arbitrary_entry() {
        let set = PeerSet::new();
        let a = test_peer(1).await;
        let b = test_peer(2).await;
        let c = test_peer(3).await;

        assert!(set.add_with_capacity(a.clone(), 2).is_none());
        assert!(set.add_with_capacity(b.clone(), 2).is_none());

        let evicted = set.add_with_capacity(c.clone(), 2).unwrap();
        assert!(evicted.node().id == a.node().id || evicted.node().id == b.node().id);
        assert_eq!(set.count(), 2);
        assert_eq!(set.count(), set.shard_total());
        assert!(set.contains(&c.node().id));
    }

    #[tokio::test]
    async fn test_rand_peer() {
        let set = PeerSet::new();
        assert!(set.rand_peer().is_none());

        let peer = test_peer(1).await;
        set.add(peer.clone());
        assert_eq!(set.rand_peer().unwrap().node().id, peer.node().id);
    }
}
