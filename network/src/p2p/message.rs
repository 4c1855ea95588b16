// Framed message passed between a peer and its sub-protocols.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::config::{COMPRESSION_THRESHOLD, MAX_MESSAGE_SIZE};
use crate::error::{P2pError, P2pResult};

// Control message codes, reserved below BASE_PROTOCOL_CODE.
pub const CTL_MSG_PING: u16 = 1;
pub const CTL_MSG_PONG: u16 = 2;
pub const CTL_MSG_DISCONNECT: u16 = 3;
pub const CTL_MSG_HANDSHAKE: u16 = 10;

// A Message is an opaque payload tagged with a code. The network core
// frames, compresses and routes it; it never looks inside the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: u16,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(code: u16, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    // Compress the payload when it is larger than the threshold.
    // Returns whether the compression flag must be set on the frame.
    pub fn zip(&mut self) -> P2pResult<bool> {
        if self.payload.len() <= COMPRESSION_THRESHOLD {
            return Ok(false);
        }

        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&self.payload)?;
        self.payload = encoder.finish()?;
        Ok(true)
    }

    // Decompress a payload whose frame carried the compression flag.
    pub fn unzip(&mut self) -> P2pResult<()> {
        let decoder = GzDecoder::new(&self.payload[..]);
        let mut output = Vec::new();
        decoder
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_to_end(&mut output)?;

        if output.len() > MAX_MESSAGE_SIZE {
            return Err(P2pError::MessageTooLarge(output.len(), MAX_MESSAGE_SIZE));
        }

        self.payload = output;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_not_compressed() {
        let payload = vec![42u8; COMPRESSION_THRESHOLD];
        let mut msg = Message::new(20, payload.clone());

        assert!(!msg.zip().unwrap());
        assert_eq!(msg.payload, payload);
    }

    #[test]
    fn test_large_payload_roundtrip() {
        let payload: Vec<u8> = (0..COMPRESSION_THRESHOLD * 4).map(|i| (i % 7) as u8).collect();
        let mut msg = Message::new(20, payload.clone());

        assert!(msg.zip().unwrap());
        assert_ne!(msg.payload, payload);

        msg.unzip().unwrap();
        assert_eq!(msg.payload, payload);
    }

    #[test]
    fn test_unzip_garbage_fails() {
        let mut msg = Message::new(20, vec![1, 2, 3, 4]);
        assert!(msg.unzip().is_err());
    }
}
