// Sub-protocol contract between the network core and application
// modules (chain sync, transaction relay, ...).

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use shardnet_common::serializer::{Reader, ReaderError, Serializer, Writer};

use crate::config::PROTOCOL_CHANNEL_SIZE;

use super::message::Message;
use super::peer::Peer;

// Longest capability name accepted in a handshake.
const MAX_CAP_NAME_LEN: usize = 64;

// One sub-protocol a node supports, advertised during handshake.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Capability {
    pub name: String,
    pub version: u32,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

impl Serializer for Capability {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let len = reader.read_u8()? as usize;
        if len == 0 || len > MAX_CAP_NAME_LEN {
            return Err(ReaderError::InvalidSize);
        }
        let bytes = reader.read_bytes(len)?;
        let name = String::from_utf8(bytes.to_vec()).map_err(|_| ReaderError::InvalidString)?;
        let version = reader.read_u32()?;
        Ok(Self { name, version })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.name.len() as u8);
        writer.write_bytes(self.name.as_bytes());
        writer.write_u32(self.version);
    }

    fn size(&self) -> usize {
        1 + self.name.len() + 4
    }
}

// A message received from a peer, delivered to the owning
// sub-protocol. The code is relative to the protocol's range.
pub struct InboundMessage {
    pub peer: Arc<Peer>,
    pub message: Message,
}

// Receiving ends of the notification channels, handed to the module
// that implements the sub-protocol.
pub struct ProtocolChannels {
    pub add_peer_rx: mpsc::Receiver<Arc<Peer>>,
    pub del_peer_rx: mpsc::Receiver<Arc<Peer>>,
    pub read_msg_rx: mpsc::Receiver<InboundMessage>,
}

// Sending ends plus the identity of one sub-protocol, held by the
// network core. Channels are bounded: a slow consumer back-pressures
// the delivering peer loop instead of growing without bound, and every
// delivery is raced against peer shutdown so a closed peer never sends.
pub struct ProtocolBase {
    pub name: String,
    pub version: u32,
    // number of message codes the protocol uses
    pub length: u16,
    pub add_peer_tx: mpsc::Sender<Arc<Peer>>,
    pub del_peer_tx: mpsc::Sender<Arc<Peer>>,
    pub read_msg_tx: mpsc::Sender<InboundMessage>,
}

impl ProtocolBase {
    pub fn new(name: impl Into<String>, version: u32, length: u16) -> (Self, ProtocolChannels) {
        let (add_peer_tx, add_peer_rx) = mpsc::channel(PROTOCOL_CHANNEL_SIZE);
        let (del_peer_tx, del_peer_rx) = mpsc::channel(PROTOCOL_CHANNEL_SIZE);
        let (read_msg_tx, read_msg_rx) = mpsc::channel(PROTOCOL_CHANNEL_SIZE);

        (
            Self {
                name: name.into(),
                version,
                length,
                add_peer_tx,
                del_peer_tx,
                read_msg_tx,
            },
            ProtocolChannels {
                add_peer_rx,
                del_peer_rx,
                read_msg_rx,
            },
        )
    }

    pub fn cap(&self) -> Capability {
        Capability::new(self.name.clone(), self.version)
    }
}

// The boundary application modules implement to ride on the network
// core. The module owns its run loop and drains the channels; the core
// only pushes events in.
pub trait SubProtocol: Send + Sync + 'static {
    fn base_protocol(&self) -> &ProtocolBase;

    // Start the protocol's own consumer loop(s).
    fn run(self: Arc<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_display() {
        let cap = Capability::new("shard", 2);
        assert_eq!(cap.to_string(), "shard/2");
    }

    #[test]
    fn test_capability_roundtrip() {
        let cap = Capability::new("sync", 7);
        let decoded = Capability::from_bytes(&cap.to_bytes()).unwrap();
        assert_eq!(decoded, cap);
    }

    #[test]
    fn test_capability_empty_name_rejected() {
        let cap = Capability::new("", 1);
        assert!(Capability::from_bytes(&cap.to_bytes()).is_err());
    }

    #[test]
    fn test_capability_ordering() {
        let mut caps = vec![
            Capability::new("tx", 1),
            Capability::new("sync", 2),
            Capability::new("sync", 1),
        ];
        caps.sort();
        assert_eq!(caps[0], Capability::new("sync", 1));
        assert_eq!(caps[1], Capability::new("sync", 2));
        assert_eq!(caps[2], Capability::new("tx", 1));
    }

    #[test]
    fn test_protocol_base_cap() {
        let (base, _channels) = ProtocolBase::new("test", 1, 4);
        assert_eq!(base.cap(), Capability::new("test", 1));
        assert_eq!(base.length, 4);
    }
}
