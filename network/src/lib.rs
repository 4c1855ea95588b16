//! Shard-aware peer-to-peer networking core.
//!
//! Two halves, glued together by the [`p2p::Server`]:
//!
//! - [`discovery`]: Kademlia-style node discovery over UDP. Maintains a
//!   distance-indexed routing table plus shard-indexed buckets, and a
//!   persistent node database seeded from trust nodes.
//! - [`p2p`]: TCP peer connections. A single framed connection per peer
//!   multiplexes several application sub-protocols over negotiated code
//!   ranges, with keepalive pings and a capability handshake.
//!
//! The server pulls random candidates out of the discovery table, dials
//! them, and registers the resulting peers in a shard-aware peer set.
//! Application modules (chain sync, transaction relay, ...) plug in
//! through the [`p2p::SubProtocol`] contract and receive peer and
//! message events over bounded channels.

pub mod config;
pub mod discovery;
pub mod error;
pub mod p2p;
