// Raw TCP framing primitive shared by the handshake, the control
// channel and every sub-protocol.
//
// Frame layout: [code: u16 BE][size: u32 BE][payload]. The high bit of
// the size field is the compression flag; payloads above the threshold
// travel gzip-compressed.

use std::net::SocketAddr;

use log::trace;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::{FRAME_READ_TIMEOUT, FRAME_WRITE_TIMEOUT, MAX_MESSAGE_SIZE};
use crate::error::{P2pError, P2pResult};

use super::message::Message;

// Frame header: 2 bytes code + 4 bytes size.
pub const FRAME_HEADER_SIZE: usize = 6;

// High bit of the size field marks a compressed payload.
pub const COMPRESSION_FLAG: u32 = 1 << 31;

pub struct Connection {
    // halves behind their own locks so a read and a write can run
    // concurrently
    read_half: Mutex<OwnedReadHalf>,
    write_half: Mutex<OwnedWriteHalf>,
    addr: SocketAddr,
    // outgoing connection (we dialed) or incoming (they dialed)
    out: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, out: bool) -> P2pResult<Self> {
        let addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            addr,
            out,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_out(&self) -> bool {
        self.out
    }

    // Read one complete frame. A connection that produces no frame
    // within the read timeout is treated as failed.
    pub async fn read_msg(&self) -> P2pResult<Message> {
        let mut half = self.read_half.lock().await;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        timeout(FRAME_READ_TIMEOUT, half.read_exact(&mut header))
            .await
            .map_err(|_| P2pError::ReadTimeout)??;

        let code = u16::from_be_bytes([header[0], header[1]]);
        let raw_size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
        let compressed = raw_size & COMPRESSION_FLAG != 0;
        let size = (raw_size & !COMPRESSION_FLAG) as usize;

        if size > MAX_MESSAGE_SIZE {
            return Err(P2pError::MessageTooLarge(size, MAX_MESSAGE_SIZE));
        }

        let mut payload = vec![0u8; size];
        if size > 0 {
            timeout(FRAME_READ_TIMEOUT, half.read_exact(&mut payload))
                .await
                .map_err(|_| P2pError::ReadTimeout)??;
        }
        drop(half);

        let mut msg = Message::new(code, payload);
        if compressed {
            msg.unzip()?;
        }

        trace!("read frame code={} size={} from {}", code, size, self.addr);
        Ok(msg)
    }

    // Frame and send one message, compressing large payloads.
    pub async fn write_msg(&self, mut msg: Message) -> P2pResult<()> {
        let compressed = msg.zip()?;

        if msg.payload.len() > MAX_MESSAGE_SIZE {
            return Err(P2pError::MessageTooLarge(msg.payload.len(), MAX_MESSAGE_SIZE));
        }

        let mut raw_size = msg.payload.len() as u32;
        if compressed {
            raw_size |= COMPRESSION_FLAG;
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0..2].copy_from_slice(&msg.code.to_be_bytes());
        header[2..6].copy_from_slice(&raw_size.to_be_bytes());

        let mut half = self.write_half.lock().await;
        timeout(FRAME_WRITE_TIMEOUT, half.write_all(&header))
            .await
            .map_err(|_| P2pError::WriteTimeout)??;
        if !msg.payload.is_empty() {
            timeout(FRAME_WRITE_TIMEOUT, half.write_all(&msg.payload))
                .await
                .map_err(|_| P2pError::WriteTimeout)??;
        }
        timeout(FRAME_WRITE_TIMEOUT, half.flush())
            .await
            .map_err(|_| P2pError::WriteTimeout)??;

        trace!(
            "wrote frame code={} size={} to {}",
            msg.code,
            msg.payload.len(),
            self.addr
        );
        Ok(())
    }

    // Shut the write side down; the remote read loop observes EOF.
    pub async fn close(&self) {
        let mut half = self.write_half.lock().await;
        let _ = half.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::COMPRESSION_THRESHOLD;
    use tokio::net::TcpListener;

    async fn connection_pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialed = TcpStream::connect(addr);
        let (accepted, dialed) = tokio::join!(listener.accept(), dialed);
        let (accepted, _) = accepted.unwrap();

        (
            Connection::new(dialed.unwrap(), true).unwrap(),
            Connection::new(accepted, false).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_roundtrip_small_payload() {
        let (a, b) = connection_pair().await;
        let payload = vec![7u8; 100];

        a.write_msg(Message::new(21, payload.clone())).await.unwrap();
        let received = b.read_msg().await.unwrap();

        assert_eq!(received.code, 21);
        assert_eq!(received.payload, payload);
    }

    #[tokio::test]
    async fn test_roundtrip_compressed_payload() {
        let (a, b) = connection_pair().await;
        let payload: Vec<u8> = (0..COMPRESSION_THRESHOLD * 8).map(|i| (i / 64) as u8).collect();

        a.write_msg(Message::new(33, payload.clone())).await.unwrap();
        let received = b.read_msg().await.unwrap();

        assert_eq!(received.code, 33);
        assert_eq!(received.payload, payload);
    }

    #[tokio::test]
    async fn test_compression_flag_on_wire() {
        let (a, b) = connection_pair().await;

        // small payload: flag clear, size matches exactly
        a.write_msg(Message::new(1, vec![9u8; 16])).await.unwrap();
        {
            let mut half = b.read_half.lock().await;
            let mut header = [0u8; FRAME_HEADER_SIZE];
            half.read_exact(&mut header).await.unwrap();
            let raw_size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
            assert_eq!(raw_size & COMPRESSION_FLAG, 0);
            assert_eq!(raw_size, 16);
            let mut payload = vec![0u8; 16];
            half.read_exact(&mut payload).await.unwrap();
        }

        // large repetitive payload: flag set
        a.write_msg(Message::new(1, vec![0u8; COMPRESSION_THRESHOLD * 4]))
            .await
            .unwrap();
        {
            let mut half = b.read_half.lock().await;
            let mut header = [0u8; FRAME_HEADER_SIZE];
            half.read_exact(&mut header).await.unwrap();
            let raw_size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
            assert_ne!(raw_size & COMPRESSION_FLAG, 0);
        }
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let (a, b) = connection_pair().await;
        a.write_msg(Message::new(2, Vec::new())).await.unwrap();
        let received = b.read_msg().await.unwrap();
        assert_eq!(received.code, 2);
        assert!(received.payload.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, b) = connection_pair().await;

        // hand-craft a header announcing an oversized payload
        {
            let mut half = a.write_half.lock().await;
            let mut header = [0u8; FRAME_HEADER_SIZE];
            header[0..2].copy_from_slice(&1u16.to_be_bytes());
            header[2..6].copy_from_slice(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes());
            half.write_all(&header).await.unwrap();
            half.flush().await.unwrap();
        }

        assert!(matches!(
            b.read_msg().await,
            Err(P2pError::MessageTooLarge(_, _))
        ));
    }

    #[tokio::test]
    async fn test_read_after_close_fails() {
        let (a, b) = connection_pair().await;
        a.close().await;
        assert!(b.read_msg().await.is_err());
    }
}
