// Capability handshake exchanged as the first frame of every peer
// connection, in both directions.

use log::debug;
use tokio::time::timeout;

use shardnet_common::crypto::NodeId;
use shardnet_common::serializer::{Reader, ReaderError, Serializer, Writer};

use crate::config::HANDSHAKE_TIMEOUT;
use crate::error::{P2pError, P2pResult};

use super::connection::Connection;
use super::message::{Message, CTL_MSG_HANDSHAKE};
use super::protocol::Capability;

// Upper bound on advertised capabilities; hostile peers cannot make us
// allocate more.
const MAX_CAPS: usize = 32;

// Handshake message carrying the local network id, identity, shard and
// the supported capability list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub network_id: u64,
    pub node_id: NodeId,
    pub shard: u16,
    pub caps: Vec<Capability>,
}

impl Handshake {
    // At least one capability must be shared for two peers to be of any
    // use to each other.
    pub fn has_common_capability(&self, other: &Handshake) -> bool {
        self.caps.iter().any(|cap| other.caps.contains(cap))
    }
}

impl Serializer for Handshake {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let network_id = reader.read_u64()?;
        let node_id = NodeId::read(reader)?;
        let shard = reader.read_u16()?;

        let count = reader.read_u8()? as usize;
        if count > MAX_CAPS {
            return Err(ReaderError::InvalidSize);
        }
        let mut caps = Vec::with_capacity(count);
        for _ in 0..count {
            caps.push(Capability::read(reader)?);
        }

        Ok(Self {
            network_id,
            node_id,
            shard,
            caps,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.network_id);
        self.node_id.write(writer);
        writer.write_u16(self.shard);
        writer.write_u8(self.caps.len() as u8);
        for cap in &self.caps {
            cap.write(writer);
        }
    }

    fn size(&self) -> usize {
        8 + self.node_id.size() + 2 + 1 + self.caps.iter().map(|c| c.size()).sum::<usize>()
    }
}

// Run the handshake over a fresh connection. The dialing side sends
// first; the accepting side answers after validating. Returns the
// remote handshake, or an error that rejects the connection (closed by
// the caller, no peer created).
//
// `dial_target` is the expected identity for outbound connections; a
// remote answering with another id is rejected.
pub async fn execute(
    conn: &Connection,
    local: &Handshake,
    dial_target: Option<&NodeId>,
) -> P2pResult<Handshake> {
    let exchange = async {
        if dial_target.is_some() {
            // client side: send first, then read
            send(conn, local).await?;
            receive(conn).await
        } else {
            // server side: read first, then answer
            let remote = receive(conn).await?;
            send(conn, local).await?;
            Ok(remote)
        }
    };

    let remote = timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| P2pError::HandshakeFailed("timed out".to_owned()))??;

    if remote.network_id != local.network_id {
        return Err(P2pError::NetworkIdMismatch(
            local.network_id,
            remote.network_id,
        ));
    }

    if !local.has_common_capability(&remote) {
        return Err(P2pError::NoCommonCapability);
    }

    if let Some(expected) = dial_target {
        if remote.node_id != *expected {
            return Err(P2pError::UnexpectedNodeId);
        }
    }

    debug!(
        "handshake with {} done, {} capabilities",
        conn.addr(),
        remote.caps.len()
    );
    Ok(remote)
}

async fn send(conn: &Connection, handshake: &Handshake) -> P2pResult<()> {
    conn.write_msg(Message::new(CTL_MSG_HANDSHAKE, handshake.to_bytes()))
        .await
}

async fn receive(conn: &Connection) -> P2pResult<Handshake> {
    let msg = conn.read_msg().await?;
    if msg.code != CTL_MSG_HANDSHAKE {
        return Err(P2pError::HandshakeFailed(format!(
            "expected handshake frame, got code {}",
            msg.code
        )));
    }
    Ok(Handshake::from_bytes(&msg.payload)?)
}
