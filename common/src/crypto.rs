//! Hash and node identifier value types.
//!
//! `NodeId` is the 64-byte public-key-derived address that identifies a
//! node on the network. `Hash` is its Keccak-256 digest, used as the
//! coordinate in the Kademlia metric space.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer as SerdeSerializer};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::serializer::{Reader, ReaderError, Serializer, Writer};

/// Size of a hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Size of a node identifier in bytes.
pub const NODE_ID_SIZE: usize = 64;

#[derive(Error, Debug)]
pub enum HexDecodeError {
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Invalid length: expected {0} bytes, got {1}")]
    InvalidLength(usize, usize),
}

/// A 32-byte Keccak-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Serializer for Hash {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let bytes = reader.read_bytes(HASH_SIZE)?;
        let mut array = [0u8; HASH_SIZE];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }

    fn size(&self) -> usize {
        HASH_SIZE
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: SerdeSerializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        hex_str.parse().map_err(D::Error::custom)
    }
}

impl FromStr for Hash {
    type Err = HexDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != HASH_SIZE {
            return Err(HexDecodeError::InvalidLength(HASH_SIZE, bytes.len()));
        }
        let mut array = [0u8; HASH_SIZE];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }
}

/// A 64-byte public-key-derived node address.
///
/// Two nodes are the same entity iff their identifiers match.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    pub const fn new(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; NODE_ID_SIZE])
    }

    /// Generate a random identifier, used for ephemeral identities and tests.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Serializer for NodeId {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let bytes = reader.read_bytes(NODE_ID_SIZE)?;
        let mut array = [0u8; NODE_ID_SIZE];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }

    fn size(&self) -> usize {
        NODE_ID_SIZE
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // full 128 hex chars are noise in logs, keep a prefix
        write!(f, "NodeId({}..)", &self.to_hex()[..16])
    }
}

impl Serialize for NodeId {
    fn serialize<S: SerdeSerializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        hex_str.parse().map_err(D::Error::custom)
    }
}

impl FromStr for NodeId {
    type Err = HexDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != NODE_ID_SIZE {
            return Err(HexDecodeError::InvalidLength(NODE_ID_SIZE, bytes.len()));
        }
        let mut array = [0u8; NODE_ID_SIZE];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }
}

/// Keccak-256 digest of arbitrary bytes.
pub fn hash(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let output = hasher.finalize();
    let mut bytes = [0u8; HASH_SIZE];
    bytes.copy_from_slice(&output);
    Hash::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let a = hash(b"shardnet");
        let b = hash(b"shardnet");
        assert_eq!(a, b);
        assert_ne!(a, hash(b"shardnet2"));
        assert_ne!(a, Hash::zero());
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let value = hash(b"roundtrip");
        let parsed: Hash = value.to_hex().parse().unwrap();
        assert_eq!(parsed, value);
    }

    #[test]
    fn test_hash_serializer_roundtrip() {
        let value = hash(b"bytes");
        let decoded = Hash::from_bytes(&value.to_bytes()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_node_id_random_unique() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn test_node_id_hex_roundtrip() {
        let id = NodeId::random();
        let parsed: NodeId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_node_id_invalid_length() {
        let result: Result<NodeId, _> = "abcd".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_serde_json_roundtrip() {
        let value = hash(b"serde");
        let json = serde_json::to_string(&value).unwrap();
        let decoded: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, value);
    }
}
