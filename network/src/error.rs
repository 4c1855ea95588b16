//! Error types for the discovery and peer layers.

use std::io::Error as IoError;

use thiserror::Error;

use shardnet_common::serializer::ReaderError;

use crate::p2p::DisconnectReason;

/// Error type for discovery operations.
///
/// Only socket bind failures ever propagate to the caller; everything
/// else is logged and dropped inside the transport.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Failed to bind UDP socket on {0}: {1}")]
    BindFailed(String, IoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] ReaderError),

    #[error("Invalid node string: {0}")]
    InvalidNode(String),

    #[error("Datagram of {0} bytes exceeds the maximum of {1}")]
    PacketTooLarge(usize, usize),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Error type for peer connection operations.
#[derive(Error, Debug)]
pub enum P2pError {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] ReaderError),

    #[error("Failed to bind TCP listener on {0}: {1}")]
    BindFailed(String, IoError),

    #[error("Connection read timed out")]
    ReadTimeout,

    #[error("Connection write timed out")]
    WriteTimeout,

    #[error("Message payload of {0} bytes exceeds the limit of {1}")]
    MessageTooLarge(usize, usize),

    #[error("Invalid message code {0}")]
    InvalidMessageCode(u16),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Network id mismatch: ours is {0}, remote sent {1}")]
    NetworkIdMismatch(u64, u64),

    #[error("No common capability with remote peer")]
    NoCommonCapability,

    #[error("Remote node id does not match the dial target")]
    UnexpectedNodeId,

    #[error("Peer disconnected: {0}")]
    Disconnected(DisconnectReason),

    #[error("Peer has an invalid shard number {0}")]
    InvalidShard(u16),

    #[error("Peer is already connected")]
    DuplicatePeer,

    #[error("Peer limit reached")]
    TooManyPeers,

    #[error("Sub-protocol channel closed")]
    ProtocolChannelClosed,

    #[error("Discovery startup failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Dial timed out")]
    DialTimeout,

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type P2pResult<T> = Result<T, P2pError>;
