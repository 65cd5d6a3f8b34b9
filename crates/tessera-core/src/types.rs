//! Core data types for Tessera

use crate::{Error, PeerId, Result};
use std::fmt;
use std::str::FromStr;

/// A 256-bit position in the DHT key space
pub type Key = [u8; 32];

/// A content identifier
///
/// Content ids built by Tessera are self-describing:
/// `[version][codec][hash code][digest length][digest]`, hashing with BLAKE3.
/// Arbitrary opaque byte strings are accepted as well.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentId(Vec<u8>);

impl ContentId {
    pub const VERSION: u8 = 1;
    /// Raw bytes codec
    pub const RAW: u8 = 0x55;
    /// Structured (merkle-dag protobuf) envelope codec
    pub const DAG_PB: u8 = 0x70;
    /// BLAKE3 multihash code
    pub const BLAKE3: u8 = 0x1e;

    /// Content id of raw bytes
    pub fn raw(data: &[u8]) -> Self {
        Self::with_codec(Self::RAW, data)
    }

    /// Content id of bytes encoded with the given codec
    pub fn with_codec(codec: u8, data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = Vec::with_capacity(4 + 32);
        bytes.extend_from_slice(&[Self::VERSION, codec, Self::BLAKE3, 32]);
        bytes.extend_from_slice(digest.as_bytes());
        Self(bytes)
    }

    /// Wrap an opaque key
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::MalformedMessage("empty content id".to_string()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The codec of a self-describing content id
    pub fn codec(&self) -> Option<u8> {
        match self.0.as_slice() {
            [Self::VERSION, codec, Self::BLAKE3, 32, digest @ ..] if digest.len() == 32 => {
                Some(*codec)
            }
            _ => None,
        }
    }

    /// Position of this content id in the DHT key space
    pub fn key(&self) -> Key {
        *blake3::hash(&self.0).as_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentId({})", &hex[..hex.len().min(16)])
    }
}

impl FromStr for ContentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|e| Error::MalformedMessage(format!("content id: {}", e)))?;
        Self::from_bytes(bytes)
    }
}

/// Position of a peer in the DHT key space
pub fn peer_key(peer_id: &PeerId) -> Key {
    *peer_id.as_bytes()
}

/// A pubsub topic name
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s)
    }
}
