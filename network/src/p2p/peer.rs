// A Peer owns one framed TCP connection and the negotiated
// sub-protocols riding on it.
//
// Lifecycle: created after a successful handshake, run() blocks until a
// read error, a protocol-injected error or an explicit disconnect, then
// cleans up exactly once and joins its loops.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, trace, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;

use shardnet_common::time::{get_current_time_in_seconds, TimestampSeconds};

use crate::config::{BASE_PROTOCOL_CODE, PING_INTERVAL};
use crate::discovery::Node;
use crate::error::{P2pError, P2pResult};

use super::connection::Connection;
use super::message::{Message, CTL_MSG_DISCONNECT, CTL_MSG_PING, CTL_MSG_PONG};
use super::protocol::{InboundMessage, SubProtocol};

// Why a peer connection was terminated. Carried as a one-byte payload
// of the disconnect control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    UselessPeer,
    TooManyPeers,
    NetworkError,
    ProtocolError,
    ServerQuit,
}

impl DisconnectReason {
    pub fn to_code(self) -> u8 {
        match self {
            DisconnectReason::Requested => 0,
            DisconnectReason::UselessPeer => 1,
            DisconnectReason::TooManyPeers => 2,
            DisconnectReason::NetworkError => 3,
            DisconnectReason::ProtocolError => 4,
            DisconnectReason::ServerQuit => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DisconnectReason::Requested),
            1 => Some(DisconnectReason::UselessPeer),
            2 => Some(DisconnectReason::TooManyPeers),
            3 => Some(DisconnectReason::NetworkError),
            4 => Some(DisconnectReason::ProtocolError),
            5 => Some(DisconnectReason::ServerQuit),
            _ => None,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Requested => "disconnect requested",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::NetworkError => "network error",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::ServerQuit => "server quit",
        };
        write!(f, "{}", text)
    }
}

// One registered sub-protocol with its assigned code range
// [offset, offset + length).
struct ProtocolEntry {
    proto: Arc<dyn SubProtocol>,
    offset: u16,
}

pub struct Peer {
    node: Node,
    connection: Connection,
    protocols: Vec<ProtocolEntry>,
    created: TimestampSeconds,
    // set once by run() during teardown
    closed: AtomicBool,
    // broadcast so every loop observes shutdown
    exit: broadcast::Sender<()>,
    disc_tx: mpsc::Sender<DisconnectReason>,
    disc_rx: StdMutex<Option<mpsc::Receiver<DisconnectReason>>>,
    // sub-protocol handlers inject fatal errors here
    proto_err_tx: mpsc::Sender<P2pError>,
    proto_err_rx: StdMutex<Option<mpsc::Receiver<P2pError>>>,
}

impl Peer {
    // Build a peer over an established, handshaked connection. Each
    // sub-protocol gets a contiguous code range starting at
    // BASE_PROTOCOL_CODE, assigned in capability order.
    pub fn new(
        node: Node,
        connection: Connection,
        protocols: &[Arc<dyn SubProtocol>],
    ) -> Arc<Self> {
        let mut sorted: Vec<Arc<dyn SubProtocol>> = protocols.to_vec();
        sorted.sort_by(|a, b| a.base_protocol().cap().cmp(&b.base_protocol().cap()));

        let mut entries = Vec::with_capacity(sorted.len());
        let mut offset = BASE_PROTOCOL_CODE;
        for proto in sorted {
            let length = proto.base_protocol().length;
            entries.push(ProtocolEntry { proto, offset });
            offset += length;
        }

        let (exit, _) = broadcast::channel(1);
        let (disc_tx, disc_rx) = mpsc::channel(1);
        let (proto_err_tx, proto_err_rx) = mpsc::channel(1);

        Arc::new(Self {
            node,
            connection,
            protocols: entries,
            created: get_current_time_in_seconds(),
            closed: AtomicBool::new(false),
            exit,
            disc_tx,
            disc_rx: StdMutex::new(Some(disc_rx)),
            proto_err_tx,
            proto_err_rx: StdMutex::new(Some(proto_err_rx)),
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn shard(&self) -> u16 {
        self.node.shard
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn created(&self) -> TimestampSeconds {
        self.created
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // Subscribe to the shutdown signal; the channel yields once the
    // peer starts terminating.
    pub fn closed_receiver(&self) -> broadcast::Receiver<()> {
        self.exit.subscribe()
    }

    // Request termination. Non-blocking and best-effort: a racing
    // shutdown never deadlocks the caller.
    pub fn disconnect(&self, reason: DisconnectReason) {
        if self.is_closed() {
            return;
        }
        let _ = self.disc_tx.try_send(reason);
    }

    // Inject a fatal error from a sub-protocol handler.
    pub fn protocol_error(&self, err: P2pError) {
        if self.is_closed() {
            return;
        }
        let _ = self.proto_err_tx.try_send(err);
    }

    // Send a sub-protocol message; `code` is relative to the
    // protocol's range.
    pub async fn send_msg(&self, protocol: &str, code: u16, payload: Vec<u8>) -> P2pResult<()> {
        let entry = self
            .protocols
            .iter()
            .find(|e| e.proto.base_protocol().name == protocol)
            .ok_or(P2pError::InvalidMessageCode(code))?;

        if code >= entry.proto.base_protocol().length {
            return Err(P2pError::InvalidMessageCode(code));
        }

        self.connection
            .write_msg(Message::new(entry.offset + code, payload))
            .await
    }

    async fn send_ctl(&self, code: u16, payload: Vec<u8>) -> P2pResult<()> {
        self.connection.write_msg(Message::new(code, payload)).await
    }

    // Drive the peer until a terminal event, then tear down exactly
    // once. Sub-protocols are notified on entry and after teardown;
    // their channels are never written to once the exit signal fired.
    pub async fn run(self: Arc<Self>) {
        for entry in &self.protocols {
            if entry
                .proto
                .base_protocol()
                .add_peer_tx
                .send(self.clone())
                .await
                .is_err()
            {
                warn!(
                    "sub-protocol {} dropped its add-peer channel",
                    entry.proto.base_protocol().name
                );
            }
        }

        let (read_err_tx, mut read_err_rx) = mpsc::channel::<P2pError>(1);
        let read_handle = tokio::spawn(Self::read_loop(self.clone(), read_err_tx));
        let ping_handle = tokio::spawn(Self::ping_loop(self.clone()));

        let taken = {
            let mut disc = self.disc_rx.lock().expect("peer disconnect lock poisoned");
            let mut perr = self.proto_err_rx.lock().expect("peer error lock poisoned");
            disc.take().zip(perr.take())
        };
        let (mut disc_rx, mut proto_err_rx) = match taken {
            Some(channels) => channels,
            None => {
                warn!("peer {} run() invoked twice, ignoring", self.node);
                return;
            }
        };

        let err = tokio::select! {
            Some(e) = read_err_rx.recv() => e,
            Some(e) = proto_err_rx.recv() => e,
            reason = disc_rx.recv() => {
                let reason = reason.unwrap_or(DisconnectReason::NetworkError);
                // tell the remote side why, best-effort
                let _ = self.send_ctl(CTL_MSG_DISCONNECT, vec![reason.to_code()]).await;
                P2pError::Disconnected(reason)
            }
        };
        debug!("peer {} terminating: {}", self.node, err);

        self.closed.store(true, Ordering::SeqCst);
        let _ = self.exit.send(());
        self.connection.close().await;
        let _ = read_handle.await;
        let _ = ping_handle.await;

        for entry in &self.protocols {
            let _ = entry
                .proto
                .base_protocol()
                .del_peer_tx
                .send(self.clone())
                .await;
        }
    }

    // Sequential frame dispatch; per-protocol ordering is TCP order.
    async fn read_loop(peer: Arc<Peer>, err_tx: mpsc::Sender<P2pError>) {
        let mut exit_rx = peer.exit.subscribe();
        loop {
            tokio::select! {
                _ = exit_rx.recv() => return,
                result = peer.connection.read_msg() => {
                    let outcome = match result {
                        Ok(msg) => Self::handle_msg(&peer, msg).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = outcome {
                        let _ = err_tx.send(e).await;
                        return;
                    }
                }
            }
        }
    }

    async fn handle_msg(peer: &Arc<Peer>, msg: Message) -> P2pResult<()> {
        if msg.code < BASE_PROTOCOL_CODE {
            match msg.code {
                CTL_MSG_PING => {
                    trace!("control ping from {}, replying pong", peer.node);
                    peer.send_ctl(CTL_MSG_PONG, Vec::new()).await?;
                }
                CTL_MSG_PONG => {
                    trace!("control pong from {}", peer.node);
                }
                CTL_MSG_DISCONNECT => {
                    let reason = msg
                        .payload
                        .first()
                        .and_then(|c| DisconnectReason::from_code(*c))
                        .unwrap_or(DisconnectReason::Requested);
                    return Err(P2pError::Disconnected(reason));
                }
                other => return Err(P2pError::InvalidMessageCode(other)),
            }
            return Ok(());
        }

        for entry in &peer.protocols {
            let base = entry.proto.base_protocol();
            if msg.code >= entry.offset && msg.code < entry.offset + base.length {
                let inbound = InboundMessage {
                    peer: peer.clone(),
                    message: Message::new(msg.code - entry.offset, msg.payload),
                };

                // blocking send is the back-pressure policy; racing the
                // exit signal keeps a closing peer from writing to the
                // protocol's channel
                let mut exit_rx = peer.exit.subscribe();
                tokio::select! {
                    _ = exit_rx.recv() => return Ok(()),
                    result = base.read_msg_tx.send(inbound) => {
                        result.map_err(|_| P2pError::ProtocolChannelClosed)?;
                    }
                }
                return Ok(());
            }
        }

        Err(P2pError::InvalidMessageCode(msg.code))
    }

    // Fire a keepalive ping at a fixed interval. Liveness relies on the
    // remote reciprocating and on read errors ending the read loop.
    async fn ping_loop(peer: Arc<Peer>) {
        let mut ticker = interval(PING_INTERVAL);
        let mut exit_rx = peer.exit.subscribe();
        loop {
            tokio::select! {
                _ = exit_rx.recv() => return,
                _ = ticker.tick() => {
                    if let Err(e) = peer.send_ctl(CTL_MSG_PING, Vec::new()).await {
                        debug!("keepalive to {} failed: {}", peer.node, e);
                        return;
                    }
                }
            }
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.node, self.connection.addr())
    }
}
