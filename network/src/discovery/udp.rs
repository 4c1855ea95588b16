//! UDP transport running the discovery protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, error, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, Semaphore};
use tokio::time::interval;

use shardnet_common::crypto::{Hash, NodeId};
use shardnet_common::serializer::{Reader, Serializer};

use crate::config::{
    DISCOVERY_INTERVAL, DISCOVERY_PROTOCOL_VERSION, MAX_CONCURRENT_HANDLERS, MAX_DATAGRAM_SIZE,
    MAX_PENDING_REQUESTS, NODES_BACKUP_INTERVAL, PENDING_CLEANUP_INTERVAL, PING_PONG_INTERVAL,
    RESPONSE_NODE_COUNT, RESPONSE_TIMEOUT, SHARD_COUNT, TIMEOUT_COUNT_TO_DELETE,
};
use crate::error::{DiscoveryError, DiscoveryResult};

use super::database::NodeDatabase;
use super::message::{
    message_type, DiscoveryMessage, FindNode, FindShardNode, Neighbors, Ping, Pong, RpcNode,
    ShardNode,
};
use super::node::Node;
use super::table::Table;

/// A request we sent and whose reply we still wait for.
struct PendingReply {
    node: Node,
    sent_at: Instant,
}

/// Discovery transport owning the UDP socket, the routing table and the
/// node database.
///
/// The table is mutated only under its single mutex, from the read loop
/// and the short-lived reply tasks it spawns. All failures past the
/// initial socket bind are logged and swallowed: the discovery protocol
/// must tolerate a hostile, unreliable network.
pub struct UdpTransport {
    socket: UdpSocket,
    self_node: Node,
    table: Mutex<Table>,
    db: Arc<NodeDatabase>,
    trust_nodes: Vec<Node>,
    bootstrap: Option<Node>,
    db_path: Option<PathBuf>,
    running: AtomicBool,
    shutdown: Notify,
    // keyed by (sender id, expected reply type)
    pending: Mutex<HashMap<(NodeId, u8), PendingReply>>,
    timeout_counts: Mutex<HashMap<NodeId, u32>>,
    handler_semaphore: Arc<Semaphore>,
}

impl UdpTransport {
    /// Bind the discovery socket.
    ///
    /// When the node advertises port 0 the bound port is patched in, so
    /// callers can use an OS-assigned port.
    pub async fn new(
        mut self_node: Node,
        trust_nodes: Vec<Node>,
        bootstrap: Option<Node>,
        db_path: Option<PathBuf>,
    ) -> DiscoveryResult<Arc<Self>> {
        let bind_addr = self_node.udp_addr();
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DiscoveryError::BindFailed(bind_addr.to_string(), e))?;

        let local = socket.local_addr()?;
        if self_node.udp_port == 0 {
            self_node = Node::with_addr(self_node.id, local, self_node.shard);
        }

        info!(
            "discovery listening on {} (node: {})",
            local, self_node
        );

        Ok(Arc::new(Self {
            socket,
            table: Mutex::new(Table::new(self_node.clone())),
            self_node,
            db: Arc::new(NodeDatabase::new()),
            trust_nodes,
            bootstrap,
            db_path,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            pending: Mutex::new(HashMap::new()),
            timeout_counts: Mutex::new(HashMap::new()),
            handler_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_HANDLERS)),
        }))
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    pub fn db(&self) -> &Arc<NodeDatabase> {
        &self.db
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Read-only snapshot of random table entries, the only view the
    /// peer server takes of discovery state.
    pub fn get_rand_nodes(&self, count: usize) -> Vec<Node> {
        let table = self.table.lock().expect("table lock poisoned");
        table.get_rand_nodes(count)
    }

    pub fn node_count(&self) -> usize {
        self.db.len()
    }

    /// Start the read loop and the maintenance loop.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("discovery transport already running");
            return;
        }

        // seed the database: trust nodes first, then any backup from a
        // previous run
        for node in &self.trust_nodes {
            self.add_node(node.clone());
        }
        if let Some(path) = &self.db_path {
            if path.exists() {
                match NodeDatabase::load_from(path) {
                    Ok(nodes) => {
                        for node in nodes {
                            self.add_node(node);
                        }
                    }
                    Err(e) => warn!("failed to load node backup: {}", e),
                }
            }
        }

        if let Some(bootstrap) = self.bootstrap.clone() {
            info!("pinging bootstrap node {}", bootstrap);
            self.add_node(bootstrap.clone());
            self.ping(&bootstrap).await;
        }

        let transport = Arc::clone(&self);
        tokio::spawn(async move {
            transport.read_loop().await;
        });

        let transport = Arc::clone(&self);
        tokio::spawn(async move {
            transport.maintenance_loop().await;
        });
    }

    /// Stop both loops. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        self.backup_nodes();
    }

    /// Insert a node into table and database, skipping ourselves.
    pub fn add_node(&self, node: Node) {
        if node.id == self.self_node.id {
            return;
        }

        {
            let mut table = self.table.lock().expect("table lock poisoned");
            table.add_node(node.clone());
        }

        if self.db.add(node.clone()) {
            info!("added node {}, total known nodes: {}", node, self.db.len());
        }
    }

    fn delete_node(&self, node: &Node) {
        if node.id == self.self_node.id {
            return;
        }

        {
            let mut table = self.table.lock().expect("table lock poisoned");
            table.delete_node(node);
        }
        self.db.delete(&node.sha());
        info!(
            "deleted unresponsive node {}, total known nodes: {}",
            node,
            self.db.len()
        );
    }

    // ===== sending =====

    async fn send_msg(&self, msg: DiscoveryMessage, to: SocketAddr) -> DiscoveryResult<()> {
        let bytes = msg.to_bytes();
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(DiscoveryError::PacketTooLarge(bytes.len(), MAX_DATAGRAM_SIZE));
        }

        self.socket.send_to(&bytes, to).await?;
        trace!("sent [{}] ({} bytes) to {}", msg.name(), bytes.len(), to);
        Ok(())
    }

    fn register_pending(&self, node: &Node, reply_type: u8) -> bool {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        if pending.len() >= MAX_PENDING_REQUESTS {
            pending.retain(|_, p| p.sent_at.elapsed() <= RESPONSE_TIMEOUT);
        }
        if pending.len() >= MAX_PENDING_REQUESTS {
            warn!("pending requests at capacity, dropping request to {}", node);
            return false;
        }

        pending.insert(
            (node.id, reply_type),
            PendingReply {
                node: node.clone(),
                sent_at: Instant::now(),
            },
        );
        true
    }

    fn take_pending(&self, id: &NodeId, reply_type: u8) -> Option<PendingReply> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.remove(&(*id, reply_type))
    }

    /// Send a ping and expect a pong back.
    pub async fn ping(&self, node: &Node) {
        if !self.register_pending(node, message_type::PONG) {
            return;
        }

        let msg = DiscoveryMessage::Ping(Ping {
            version: DISCOVERY_PROTOCOL_VERSION,
            id: self.self_node.id,
            shard: self.self_node.shard,
        });

        debug!("send [ping] to {}", node);
        if let Err(e) = self.send_msg(msg, node.udp_addr()).await {
            warn!("failed to ping {}: {}", node, e);
        }
    }

    /// Ask `to` for nodes close to `target`.
    pub async fn find_node(&self, target: Hash, to: &Node) {
        if !self.register_pending(to, message_type::NEIGHBORS) {
            return;
        }

        let msg = DiscoveryMessage::FindNode(FindNode {
            id: self.self_node.id,
            target,
        });

        debug!("send [find_node] to {}", to);
        if let Err(e) = self.send_msg(msg, to.udp_addr()).await {
            warn!("failed to send find_node to {}: {}", to, e);
        }
    }

    /// Ask `to` for nodes of `shard`.
    pub async fn find_shard_node(&self, shard: u16, to: &Node) {
        if !self.register_pending(to, message_type::SHARD_NODE) {
            return;
        }

        let msg = DiscoveryMessage::FindShardNode(FindShardNode {
            id: self.self_node.id,
            shard,
        });

        debug!("send [find_shard_node] for shard {} to {}", shard, to);
        if let Err(e) = self.send_msg(msg, to.udp_addr()).await {
            warn!("failed to send find_shard_node to {}: {}", to, e);
        }
    }

    // ===== receiving =====

    async fn read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => {
                        if !self.running.load(Ordering::SeqCst) {
                            break;
                        }

                        // bound concurrent handlers, drop excess packets
                        let permit = match self.handler_semaphore.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                debug!("dropping datagram from {} (handlers at capacity)", from);
                                continue;
                            }
                        };

                        let data = buf[..len].to_vec();
                        let transport = Arc::clone(&self);
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = transport.handle_datagram(&data, from).await {
                                debug!("dropped datagram from {}: {}", from, e);
                            }
                        });
                    }
                    Err(e) => {
                        if !self.running.load(Ordering::SeqCst) {
                            break;
                        }
                        error!("failed to read from discovery socket: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> DiscoveryResult<()> {
        let mut reader = Reader::new(data);
        let msg = DiscoveryMessage::read(&mut reader)?;
        if reader.size() > 0 {
            debug!(
                "datagram from {} has {} trailing bytes, dropping",
                from,
                reader.size()
            );
            return Ok(());
        }

        trace!("received [{}] from {}", msg.name(), from);

        match msg {
            DiscoveryMessage::Ping(ping) => self.handle_ping(ping, from).await,
            DiscoveryMessage::Pong(pong) => self.handle_pong(pong, from),
            DiscoveryMessage::FindNode(find_node) => self.handle_find_node(find_node, from).await,
            DiscoveryMessage::Neighbors(neighbors) => self.handle_neighbors(neighbors, from),
            DiscoveryMessage::FindShardNode(find) => self.handle_find_shard_node(find, from).await,
            DiscoveryMessage::ShardNode(shard_node) => self.handle_shard_node(shard_node, from),
        }

        Ok(())
    }

    async fn handle_ping(&self, ping: Ping, from: SocketAddr) {
        if ping.version != DISCOVERY_PROTOCOL_VERSION {
            debug!(
                "dropping ping from {} with protocol version {}",
                from, ping.version
            );
            return;
        }

        let node = Node::with_addr(ping.id, from, ping.shard);
        self.add_node(node.clone());
        self.reset_timeout_count(&ping.id);

        let reply = DiscoveryMessage::Pong(Pong {
            id: self.self_node.id,
            shard: self.self_node.shard,
        });

        debug!("received [ping], sending [pong] to {}", node);
        if let Err(e) = self.send_msg(reply, from).await {
            warn!("failed to send pong to {}: {}", from, e);
        }
    }

    fn handle_pong(&self, pong: Pong, from: SocketAddr) {
        match self.take_pending(&pong.id, message_type::PONG) {
            Some(_) => {
                // the sender answered our ping: refresh it in table and
                // database with the address it answered from
                let node = Node::with_addr(pong.id, from, pong.shard);
                debug!("received [pong] from {}", node);
                self.add_node(node);
                self.reset_timeout_count(&pong.id);
            }
            None => {
                // unsolicited pongs refresh known nodes only; strangers
                // must go through a ping we initiated
                if self.db.contains(&pong.id) {
                    let node = Node::with_addr(pong.id, from, pong.shard);
                    self.add_node(node);
                    self.reset_timeout_count(&pong.id);
                } else {
                    debug!("ignoring unsolicited pong from unknown sender {}", from);
                }
            }
        }
    }

    async fn handle_find_node(&self, find_node: FindNode, from: SocketAddr) {
        debug!("received [find_node] from {}", from);

        let nodes: Vec<RpcNode> = {
            let table = self.table.lock().expect("table lock poisoned");
            table
                .find_node_with_target(&find_node.target)
                .iter()
                .map(RpcNode::from)
                .collect()
        };

        if nodes.is_empty() {
            return;
        }

        let reply = DiscoveryMessage::Neighbors(Neighbors {
            id: self.self_node.id,
            nodes,
        });

        if let Err(e) = self.send_msg(reply, from).await {
            warn!("failed to send neighbors to {}: {}", from, e);
        }
    }

    fn handle_neighbors(&self, neighbors: Neighbors, from: SocketAddr) {
        if self
            .take_pending(&neighbors.id, message_type::NEIGHBORS)
            .is_none()
        {
            debug!("ignoring unsolicited neighbors from {}", from);
            return;
        }

        debug!(
            "received [neighbors] with {} nodes from {}",
            neighbors.nodes.len(),
            from
        );
        for rpc_node in &neighbors.nodes {
            self.add_node(rpc_node.to_node());
        }
    }

    async fn handle_find_shard_node(&self, find: FindShardNode, from: SocketAddr) {
        debug!(
            "received [find_shard_node] for shard {} from {}",
            find.shard, from
        );

        let nodes: Vec<RpcNode> = {
            let table = self.table.lock().expect("table lock poisoned");
            table
                .find_shard_nodes(find.shard, RESPONSE_NODE_COUNT)
                .iter()
                .map(RpcNode::from)
                .collect()
        };

        if nodes.is_empty() {
            return;
        }

        let reply = DiscoveryMessage::ShardNode(ShardNode {
            id: self.self_node.id,
            shard: find.shard,
            nodes,
        });

        if let Err(e) = self.send_msg(reply, from).await {
            warn!("failed to send shard_node to {}: {}", from, e);
        }
    }

    fn handle_shard_node(&self, shard_node: ShardNode, from: SocketAddr) {
        if self
            .take_pending(&shard_node.id, message_type::SHARD_NODE)
            .is_none()
        {
            debug!("ignoring unsolicited shard_node from {}", from);
            return;
        }

        debug!(
            "received [shard_node] with {} nodes of shard {} from {}",
            shard_node.nodes.len(),
            shard_node.shard,
            from
        );
        for rpc_node in &shard_node.nodes {
            self.add_node(rpc_node.to_node());
        }
    }

    // ===== periodic maintenance =====

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ping_timer = interval(PING_PONG_INTERVAL);
        let mut discovery_timer = interval(DISCOVERY_INTERVAL);
        let mut cleanup_timer = interval(PENDING_CLEANUP_INTERVAL);
        let mut backup_timer = interval(NODES_BACKUP_INTERVAL);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = ping_timer.tick() => self.ping_round().await,
                _ = discovery_timer.tick() => self.discovery_round().await,
                _ = cleanup_timer.tick() => self.expire_pending(),
                _ = backup_timer.tick() => self.backup_nodes(),
            }
        }
    }

    /// Re-ping every node we know about: trust nodes always, plus the
    /// current database snapshot.
    async fn ping_round(&self) {
        let mut targets: HashMap<SocketAddr, Node> = HashMap::new();
        for node in &self.trust_nodes {
            targets.insert(node.udp_addr(), node.clone());
        }
        for node in self.db.get_copy().into_values() {
            targets.insert(node.udp_addr(), node);
        }

        debug!("ping round over {} nodes", targets.len());
        for node in targets.into_values() {
            self.ping(&node).await;
        }
    }

    /// Query for a random target and fill underpopulated shard buckets.
    async fn discovery_round(&self) {
        let target = Hash::new(rand::random::<[u8; 32]>());

        let (candidates, shard_queries) = {
            let table = self.table.lock().expect("table lock poisoned");
            let candidates = table.find_closest(&target, crate::config::ALPHA);

            let mut shard_queries = Vec::new();
            for shard in 1..=SHARD_COUNT {
                if table.shard_bucket_len(shard) < crate::config::BUCKET_SIZE {
                    shard_queries.push((shard, table.rand_shard_node(shard)));
                }
            }
            (candidates, shard_queries)
        };

        debug!("discovery round: querying {} candidates", candidates.len());
        for node in &candidates {
            self.find_node(target, node).await;
        }

        for (shard, maybe_node) in shard_queries {
            // an empty shard bucket falls back to any known node
            let node = match maybe_node.or_else(|| self.db.rand_node()) {
                Some(node) => node,
                None => continue,
            };
            if node.id == self.self_node.id {
                continue;
            }
            self.find_shard_node(shard, &node).await;
        }
    }

    /// Drop expired pending requests; count ping timeouts and delete
    /// nodes that stayed silent for too many rounds.
    fn expire_pending(&self) {
        let expired: Vec<((NodeId, u8), PendingReply)> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            let keys: Vec<(NodeId, u8)> = pending
                .iter()
                .filter(|(_, p)| p.sent_at.elapsed() > RESPONSE_TIMEOUT)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| pending.remove(&k).map(|p| (k, p)))
                .collect()
        };

        for ((id, reply_type), reply) in expired {
            if reply_type != message_type::PONG {
                debug!("request to {} timed out", reply.node);
                continue;
            }

            let count = {
                let mut counts = self.timeout_counts.lock().expect("timeout counts lock poisoned");
                let count = counts.entry(id).or_insert(0);
                *count += 1;
                *count
            };

            if count >= TIMEOUT_COUNT_TO_DELETE {
                self.delete_node(&reply.node);
                self.reset_timeout_count(&id);
            } else {
                debug!("node {} timed out, count {}", reply.node, count);
            }
        }
    }

    fn reset_timeout_count(&self, id: &NodeId) {
        let mut counts = self.timeout_counts.lock().expect("timeout counts lock poisoned");
        counts.remove(id);
    }

    fn backup_nodes(&self) {
        if let Some(path) = &self.db_path {
            if let Err(e) = self.db.save_to(path) {
                warn!("node backup failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardnet_common::crypto::NodeId;
    use std::net::{IpAddr, Ipv4Addr};

    fn local_node(shard: u16) -> Node {
        // port 0: the transport patches in the bound port
        Node::new(
            NodeId::random(),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            0,
            shard,
        )
    }

    #[tokio::test]
    async fn test_bind_assigns_port() {
        let transport = UdpTransport::new(local_node(1), Vec::new(), None, None)
            .await
            .unwrap();
        assert_ne!(transport.self_node().udp_port, 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let first = UdpTransport::new(local_node(1), Vec::new(), None, None)
            .await
            .unwrap();
        let addr = first.self_node().udp_addr();

        let second =
            UdpTransport::new(Node::with_addr(NodeId::random(), addr, 1), Vec::new(), None, None)
                .await;
        assert!(matches!(second, Err(DiscoveryError::BindFailed(_, _))));
    }

    #[tokio::test]
    async fn test_add_node_skips_self() {
        let transport = UdpTransport::new(local_node(1), Vec::new(), None, None)
            .await
            .unwrap();
        transport.add_node(transport.self_node().clone());
        assert_eq!(transport.node_count(), 0);
    }

    #[tokio::test]
    async fn test_unsolicited_pong_from_stranger_ignored() {
        let transport = UdpTransport::new(local_node(1), Vec::new(), None, None)
            .await
            .unwrap();

        let stranger = NodeId::random();
        transport.handle_pong(
            Pong {
                id: stranger,
                shard: 1,
            },
            "127.0.0.1:9".parse().unwrap(),
        );
        assert_eq!(transport.node_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let transport = UdpTransport::new(local_node(1), Vec::new(), None, None)
            .await
            .unwrap();

        let from = "127.0.0.1:9".parse().unwrap();
        // unknown type byte
        assert!(transport.handle_datagram(&[0xff, 1, 2], from).await.is_err());
        // empty datagram
        assert!(transport.handle_datagram(&[], from).await.is_err());
        // nothing was added to the table or database
        assert_eq!(transport.node_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_counting_deletes_node() {
        let transport = UdpTransport::new(local_node(1), Vec::new(), None, None)
            .await
            .unwrap();

        let node = Node::new(
            NodeId::random(),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            1,
            1,
        );
        transport.add_node(node.clone());
        assert_eq!(transport.node_count(), 1);

        // simulate TIMEOUT_COUNT_TO_DELETE expired ping rounds
        for _ in 0..TIMEOUT_COUNT_TO_DELETE {
            {
                let mut pending = transport.pending.lock().unwrap();
                pending.insert(
                    (node.id, message_type::PONG),
                    PendingReply {
                        node: node.clone(),
                        sent_at: Instant::now() - RESPONSE_TIMEOUT * 2,
                    },
                );
            }
            transport.expire_pending();
        }

        assert_eq!(transport.node_count(), 0);
        assert!(transport.get_rand_nodes(10).is_empty());
    }
}
