// The Server bridges discovery output into peer connections: it owns
// the TCP listener, the dial scheduler, the handshake logic and the
// peer set.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

use shardnet_common::crypto::NodeId;

use crate::config::{
    NetworkConfig, BUCKET_SIZE, DIAL_SCHEDULER_INTERVAL, DIAL_TIMEOUT, SHARD_COUNT,
    UNDEFINED_SHARD_NUMBER,
};
use crate::discovery::{Node, UdpTransport};
use crate::error::{P2pError, P2pResult};

use super::connection::Connection;
use super::handshake::{self, Handshake};
use super::node_set::NodeSet;
use super::peer::{DisconnectReason, Peer};
use super::peer_set::PeerSet;
use super::protocol::SubProtocol;

pub struct Server {
    config: NetworkConfig,
    node_id: NodeId,
    protocols: Vec<Arc<dyn SubProtocol>>,
    static_nodes: Vec<Node>,
    trust_nodes: Vec<Node>,
    bootstrap: Option<Node>,
    peer_set: Arc<PeerSet>,
    node_set: Arc<NodeSet>,
    transport: StdMutex<Option<Arc<UdpTransport>>>,
    local_node: StdMutex<Option<Node>>,
    running: AtomicBool,
    shutdown: Notify,
    pending_dials: StdMutex<HashSet<NodeId>>,
    handshake_slots: Arc<Semaphore>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    // serializes peer registration so concurrent handshakes cannot
    // push the set past max_peers
    peer_lock: StdMutex<()>,
}

impl Server {
    // Validate the configuration and parse the node lists. No sockets
    // are touched until start().
    pub fn new(config: NetworkConfig, protocols: Vec<Arc<dyn SubProtocol>>) -> P2pResult<Arc<Self>> {
        let node_id = match &config.node_id {
            Some(hex_id) => hex_id
                .parse()
                .map_err(|e| P2pError::InvalidConfig(format!("invalid node id: {}", e)))?,
            None => NodeId::random(),
        };

        config
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| P2pError::InvalidConfig(format!("invalid listen address: {}", e)))?;

        let static_nodes = parse_nodes(&config.static_nodes)?;
        let trust_nodes = parse_nodes(&config.trust_nodes)?;
        let bootstrap = match &config.bootstrap {
            Some(s) => Some(
                s.parse::<Node>()
                    .map_err(|e| P2pError::InvalidConfig(e.to_string()))?,
            ),
            None => None,
        };

        let handshake_slots = Arc::new(Semaphore::new(config.max_pending_peers.max(1)));

        Ok(Arc::new(Self {
            config,
            node_id,
            protocols,
            static_nodes,
            trust_nodes,
            bootstrap,
            peer_set: Arc::new(PeerSet::new()),
            node_set: Arc::new(NodeSet::new()),
            transport: StdMutex::new(None),
            local_node: StdMutex::new(None),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            pending_dials: StdMutex::new(HashSet::new()),
            handshake_slots,
            tasks: StdMutex::new(Vec::new()),
            peer_lock: StdMutex::new(()),
        }))
    }

    pub fn peer_count(&self) -> usize {
        self.peer_set.count()
    }

    pub fn peer_set(&self) -> &Arc<PeerSet> {
        &self.peer_set
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // The node we advertise, available once start() bound the sockets.
    pub fn local_node(&self) -> Option<Node> {
        self.local_node.lock().expect("local node lock poisoned").clone()
    }

    fn local_handshake(&self) -> Handshake {
        Handshake {
            network_id: self.config.network_id,
            node_id: self.node_id,
            shard: self.config.shard,
            caps: self
                .protocols
                .iter()
                .map(|p| p.base_protocol().cap())
                .collect(),
        }
    }

    fn transport(&self) -> Option<Arc<UdpTransport>> {
        self.transport.lock().expect("transport lock poisoned").clone()
    }

    // Bind the listener, start discovery, the protocol loops, the
    // accept loop and the dial scheduler. Bind failures abort startup
    // synchronously. Callers keep their handle: `server.clone().start()`.
    pub async fn start(self: Arc<Self>) -> P2pResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(P2pError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| P2pError::BindFailed(self.config.listen_addr.clone(), e))?;
        let local_addr = listener.local_addr()?;

        let self_node = Node::with_addr(self.node_id, local_addr, self.config.shard);
        info!("p2p server starting as {}", self_node);
        *self.local_node.lock().expect("local node lock poisoned") = Some(self_node.clone());

        // discovery shares the port number with the TCP listener; its
        // bind failure is fatal too. Static nodes seed the database so
        // inbound connections from them are recognized.
        let mut seeds = self.trust_nodes.clone();
        seeds.extend(self.static_nodes.iter().cloned());
        let transport = UdpTransport::new(
            self_node,
            seeds,
            self.bootstrap.clone(),
            self.config.node_db_path.as_ref().map(PathBuf::from),
        )
        .await?;
        transport.clone().start().await;
        *self.transport.lock().expect("transport lock poisoned") = Some(transport);

        for proto in &self.protocols {
            proto.clone().run();
        }

        let server = Arc::clone(&self);
        let accept_handle = tokio::spawn(async move {
            server.accept_loop(listener).await;
        });

        let server = Arc::clone(&self);
        let dial_handle = tokio::spawn(async move {
            server.dial_loop().await;
        });

        {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.push(accept_handle);
            tasks.push(dial_handle);
        }

        Ok(())
    }

    // Stop the server: close the listener, ask every peer to
    // disconnect and wait for all loops and peer tasks. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("p2p server stopping");
        self.shutdown.notify_waiters();

        self.peer_set
            .for_each(|peer| peer.disconnect(DisconnectReason::ServerQuit));

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(transport) = self.transport() {
            transport.stop();
        }
    }

    // Accept inbound connections; the semaphore bounds concurrent
    // handshakes, further connects queue in the backlog.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if !self.is_running() {
                return;
            }

            let permit = tokio::select! {
                _ = self.shutdown.notified() => return,
                permit = self.handshake_slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                }
            };

            let (stream, addr) = tokio::select! {
                _ = self.shutdown.notified() => return,
                result = listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                }
            };

            debug!("inbound connection from {}", addr);
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = Self::setup_inbound(&server, stream).await {
                    info!("inbound connection from {} rejected: {}", addr, e);
                }
            });
        }
    }

    async fn setup_inbound(server: &Arc<Server>, stream: TcpStream) -> P2pResult<()> {
        let conn = Connection::new(stream, false)?;
        let remote = handshake::execute(&conn, &server.local_handshake(), None).await?;

        // only nodes discovery already knows are admitted inbound
        let transport = server
            .transport()
            .ok_or_else(|| P2pError::HandshakeFailed("server not started".to_owned()))?;
        let node = transport
            .db()
            .find_by_id(&remote.node_id)
            .ok_or_else(|| P2pError::HandshakeFailed("unknown node id".to_owned()))?;

        Self::add_peer(server, node, conn)
    }

    // Periodic scheduler: keep static nodes connected and fill the
    // remaining peer slots with random discovered candidates.
    async fn dial_loop(self: Arc<Self>) {
        let mut ticker = interval(DIAL_SCHEDULER_INTERVAL);
        loop {
            if !self.is_running() {
                return;
            }

            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = ticker.tick() => Self::dial_round(&self),
            }
        }
    }

    fn dial_round(server: &Arc<Server>) {
        // pull a fresh snapshot out of the discovery table
        if let Some(transport) = server.transport() {
            for node in transport.get_rand_nodes(BUCKET_SIZE) {
                server.node_set.try_add(node);
            }
        }

        for node in &server.static_nodes {
            if node.id == server.node_id || server.peer_set.contains(&node.id) {
                continue;
            }
            Self::spawn_dial(server, node.clone());
        }

        let available = server.config.max_peers.saturating_sub(server.peer_set.count());
        if available == 0 {
            return;
        }

        for node in server.node_set.rand_unconnected().into_iter().take(available) {
            if node.id == server.node_id || server.peer_set.contains(&node.id) {
                continue;
            }
            Self::spawn_dial(server, node);
        }
    }

    fn spawn_dial(server: &Arc<Server>, node: Node) {
        {
            let mut pending = server.pending_dials.lock().expect("pending dials lock poisoned");
            if !pending.insert(node.id) {
                // a dial to this node is already in flight
                return;
            }
        }

        let task_server = Arc::clone(server);
        let handle = tokio::spawn(async move {
            let id = node.id;
            if let Err(e) = Self::dial(&task_server, node).await {
                debug!("dial failed: {}", e);
            }
            let mut pending = task_server
                .pending_dials
                .lock()
                .expect("pending dials lock poisoned");
            pending.remove(&id);
        });
        server.track_task(handle);
    }

    async fn dial(server: &Arc<Server>, node: Node) -> P2pResult<()> {
        let addr = node.tcp_addr();
        debug!("dialing {}", node);

        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| P2pError::DialTimeout)??;
        let conn = Connection::new(stream, true)?;

        let remote = handshake::execute(&conn, &server.local_handshake(), Some(&node.id)).await?;

        // the handshake shard is authoritative for peer placement
        let mut peer_node = Node::new(node.id, node.ip, node.udp_port, remote.shard);
        peer_node.tcp_port = node.tcp_port;

        Self::add_peer(server, peer_node, conn)
    }

    // Common registration path for inbound and outbound connections.
    fn add_peer(server: &Arc<Server>, node: Node, conn: Connection) -> P2pResult<()> {
        if node.shard == UNDEFINED_SHARD_NUMBER || node.shard > SHARD_COUNT {
            return Err(P2pError::InvalidShard(node.shard));
        }
        if node.id == server.node_id {
            return Err(P2pError::DuplicatePeer);
        }

        let peer = {
            let _guard = server.peer_lock.lock().expect("peer lock poisoned");

            if server.peer_set.contains(&node.id) {
                return Err(P2pError::DuplicatePeer);
            }
            if server.peer_set.count() >= server.config.max_peers {
                return Err(P2pError::TooManyPeers);
            }

            let peer = Peer::new(node.clone(), conn, &server.protocols);
            if let Some(evicted) = server.peer_set.add(peer.clone()) {
                evicted.disconnect(DisconnectReason::TooManyPeers);
            }
            peer
        };
        server.node_set.set_connected(&node.id, true);
        info!("added peer {}, total peers: {}", peer, server.peer_count());

        let task_server = Arc::clone(server);
        let id = node.id;
        let handle = tokio::spawn(async move {
            peer.run().await;
            task_server.peer_set.remove(&id);
            task_server.node_set.set_connected(&id, false);
            debug!("peer removed, total peers: {}", task_server.peer_count());
        });
        server.track_task(handle);

        Ok(())
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

fn parse_nodes(entries: &[String]) -> P2pResult<Vec<Node>> {
    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        let node = entry
            .parse::<Node>()
            .map_err(|e| P2pError::InvalidConfig(e.to_string()))?;
        nodes.push(node);
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            listen_addr: "127.0.0.1:0".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_with_defaults() {
        let server = Server::new(test_config(), Vec::new()).unwrap();
        assert!(!server.is_running());
        assert_eq!(server.peer_count(), 0);
        assert!(server.local_node().is_none());
    }

    #[test]
    fn test_new_rejects_bad_listen_addr() {
        let config = NetworkConfig {
            listen_addr: "not-an-address".to_owned(),
            ..Default::default()
        };
        assert!(matches!(
            Server::new(config, Vec::new()),
            Err(P2pError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_new_rejects_bad_static_node() {
        let config = NetworkConfig {
            listen_addr: "127.0.0.1:0".to_owned(),
            static_nodes: vec!["snode://garbage".to_owned()],
            ..Default::default()
        };
        assert!(matches!(
            Server::new(config, Vec::new()),
            Err(P2pError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_new_parses_configured_node_id() {
        let id = NodeId::random();
        let config = NetworkConfig {
            listen_addr: "127.0.0.1:0".to_owned(),
            node_id: Some(id.to_hex()),
            ..Default::default()
        };
        let server = Server::new(config, Vec::new()).unwrap();
        assert_eq!(server.node_id, id);
    }

    #[test]
    fn test_parse_nodes() {
        let node = Node::new(
            NodeId::random(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            8057,
            2,
        );
        let parsed = parse_nodes(&[node.to_string()]).unwrap();
        assert_eq!(parsed, vec![node]);

        assert!(parse_nodes(&["bogus".to_owned()]).is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = Server::new(test_config(), Vec::new()).unwrap();
        server.clone().start().await.unwrap();
        assert!(matches!(server.clone().start().await, Err(P2pError::AlreadyRunning)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let server = Server::new(test_config(), Vec::new()).unwrap();
        server.clone().start().await.unwrap();
        assert!(server.is_running());

        server.stop().await;
        assert!(!server.is_running());
        // second stop is a no-op
        server.stop().await;
    }

    #[tokio::test]
    async fn test_start_assigns_local_node() {
        let server = Server::new(test_config(), Vec::new()).unwrap();
        server.clone().start().await.unwrap();

        let local = server.local_node().unwrap();
        assert_ne!(local.udp_port, 0);
        assert_eq!(local.shard, 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = Server::new(test_config(), Vec::new()).unwrap();
        first.clone().start().await.unwrap();
        let addr = first.local_node().unwrap().udp_addr();

        let config = NetworkConfig {
            listen_addr: addr.to_string(),
            ..Default::default()
        };
        let second = Server::new(config, Vec::new()).unwrap();
        assert!(matches!(
            second.clone().start().await,
            Err(P2pError::BindFailed(_, _))
        ));

        first.stop().await;
    }
}
