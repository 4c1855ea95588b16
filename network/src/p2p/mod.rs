//! TCP peer connections and sub-protocol multiplexing.
//!
//! One framed TCP connection per peer carries every negotiated
//! sub-protocol. Message codes below [`crate::config::BASE_PROTOCOL_CODE`]
//! are reserved control codes (keepalive ping/pong, disconnect,
//! handshake); each sub-protocol owns a contiguous code range above it.

pub mod connection;
pub mod handshake;
pub mod message;
pub mod node_set;
pub mod peer;
pub mod peer_set;
pub mod protocol;
pub mod server;

pub use connection::Connection;
pub use handshake::Handshake;
pub use message::Message;
pub use node_set::NodeSet;
pub use peer::{DisconnectReason, Peer};
pub use peer_set::PeerSet;
pub use protocol::{Capability, InboundMessage, ProtocolBase, ProtocolChannels, SubProtocol};
pub use server::Server;
