//! Protocol buffer message definitions
//!
//! These are defined by hand with prost derives, avoiding the need for
//! protoc at build time. Every frame on a Tessera stream is an [`Envelope`].

use crate::{Error, Multiaddr, PeerId, PeerInfo, Result, PROTOCOL_VERSION};
use prost::Message;

/// Message envelope wrapping all protocol messages
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Protocol version
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Request ID for correlation
    #[prost(uint64, tag = "2")]
    pub request_id: u64,
    /// The sending peer and the addresses it listens on
    #[prost(message, optional, tag = "3")]
    pub origin: Option<PeerRecord>,
    /// The actual message payload
    #[prost(oneof = "Payload", tags = "10, 11, 12, 13, 14, 15, 16, 17, 30, 100")]
    pub payload: Option<Payload>,
}

/// Payload variants for the envelope
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "10")]
    FindNodeRequest(FindNodeRequest),
    #[prost(message, tag = "11")]
    FindNodeResponse(FindNodeResponse),
    #[prost(message, tag = "12")]
    AddProviderRequest(AddProviderRequest),
    #[prost(message, tag = "13")]
    AddProviderResponse(AddProviderResponse),
    #[prost(message, tag = "14")]
    GetProvidersRequest(GetProvidersRequest),
    #[prost(message, tag = "15")]
    GetProvidersResponse(GetProvidersResponse),
    #[prost(message, tag = "16")]
    PingRequest(PingRequest),
    #[prost(message, tag = "17")]
    PingResponse(PingResponse),
    #[prost(message, tag = "30")]
    PubSubRpc(PubSubRpc),
    #[prost(message, tag = "100")]
    ErrorResponse(ErrorResponse),
}

/// A peer id with its addresses
#[derive(Clone, PartialEq, Message)]
pub struct PeerRecord {
    #[prost(bytes, tag = "1")]
    pub peer_id: Vec<u8>,
    #[prost(string, repeated, tag = "2")]
    pub addrs: Vec<String>,
}

// DHT messages

#[derive(Clone, PartialEq, Message)]
pub struct FindNodeRequest {
    #[prost(bytes, tag = "1")]
    pub target: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FindNodeResponse {
    #[prost(message, repeated, tag = "1")]
    pub peers: Vec<PeerRecord>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AddProviderRequest {
    /// DHT key of the content id
    #[prost(bytes, tag = "1")]
    pub key: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub provider: Option<PeerRecord>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AddProviderResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetProvidersRequest {
    #[prost(bytes, tag = "1")]
    pub key: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetProvidersResponse {
    #[prost(message, repeated, tag = "1")]
    pub providers: Vec<PeerRecord>,
    #[prost(message, repeated, tag = "2")]
    pub closer_peers: Vec<PeerRecord>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PingRequest {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PingResponse {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

// PubSub messages

#[derive(Clone, PartialEq, Message)]
pub struct PubSubRpc {
    #[prost(message, repeated, tag = "1")]
    pub subscriptions: Vec<SubOpts>,
    #[prost(message, repeated, tag = "2")]
    pub messages: Vec<PubSubMessage>,
}

/// A subscription announcement
#[derive(Clone, PartialEq, Message)]
pub struct SubOpts {
    #[prost(bool, tag = "1")]
    pub subscribe: bool,
    #[prost(string, tag = "2")]
    pub topic: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PubSubMessage {
    #[prost(bytes, tag = "1")]
    pub from: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub seqno: u64,
    #[prost(string, repeated, tag = "3")]
    pub topics: Vec<String>,
    #[prost(bytes, tag = "4")]
    pub data: Vec<u8>,
}

// Transport handshake

/// First frame exchanged on every TCP stream, in both directions
#[derive(Clone, PartialEq, Message)]
pub struct Handshake {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(bytes, tag = "2")]
    pub peer_id: Vec<u8>,
    #[prost(string, repeated, tag = "3")]
    pub listen_addrs: Vec<String>,
    #[prost(string, tag = "4")]
    pub protocol: String,
}

// Error message

#[derive(Clone, PartialEq, Message)]
pub struct ErrorResponse {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

// Helper implementations

impl Envelope {
    /// Create a new envelope with the current protocol version
    pub fn new(request_id: u64, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            request_id,
            origin: None,
            payload: Some(payload),
        }
    }

    /// Attach the sender's peer record
    pub fn with_origin(mut self, origin: &PeerInfo) -> Self {
        self.origin = Some(PeerRecord::from(origin));
        self
    }

    /// Encode the envelope to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode an envelope from bytes, checking version compatibility
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let envelope = Self::decode(buf)?;
        envelope.check_version()?;
        Ok(envelope)
    }

    pub fn check_version(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION as u32 {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: self.version,
            });
        }
        Ok(())
    }
}

impl From<&PeerInfo> for PeerRecord {
    fn from(info: &PeerInfo) -> Self {
        Self {
            peer_id: info.peer_id.to_vec(),
            addrs: info.addrs.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl TryFrom<PeerRecord> for PeerInfo {
    type Error = Error;

    /// Unparseable addresses are skipped; a bad peer id is an error
    fn try_from(record: PeerRecord) -> Result<Self> {
        let peer_id = PeerId::from_slice(&record.peer_id)
            .map_err(|e| Error::MalformedMessage(format!("peer record: {}", e)))?;
        let addrs = record
            .addrs
            .iter()
            .filter_map(|a| a.parse::<Multiaddr>().ok())
            .map(|a| a.without_peer_id())
            .collect();
        Ok(PeerInfo { peer_id, addrs })
    }
}

/// Convert peer records, dropping the malformed ones
pub fn peer_infos(records: Vec<PeerRecord>) -> Vec<PeerInfo> {
    records
        .into_iter()
        .filter_map(|r| match PeerInfo::try_from(r) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::debug!("Dropping peer record: {}", e);
                None
            }
        })
        .collect()
}

/// Parse a 32-byte DHT key from the wire
pub fn key_from_bytes(bytes: &[u8]) -> Result<crate::Key> {
    bytes
        .try_into()
        .map_err(|_| Error::MalformedMessage(format!("expected 32-byte key, got {}", bytes.len())))
}

/// Error codes
pub mod error_codes {
    // Protocol errors (1xx)
    pub const VERSION_MISMATCH: u32 = 100;
    pub const INVALID_MESSAGE: u32 = 101;
    pub const UNEXPECTED_MESSAGE: u32 = 102;

    // Validation errors (3xx)
    pub const INVALID_DATA: u32 = 301;
    pub const PROVIDER_MISMATCH: u32 = 302;
}

/// Helper functions to create common message types

pub fn find_node_request(request_id: u64, target: Vec<u8>) -> Envelope {
    Envelope::new(request_id, Payload::FindNodeRequest(FindNodeRequest { target }))
}

pub fn find_node_response(request_id: u64, peers: Vec<PeerRecord>) -> Envelope {
    Envelope::new(request_id, Payload::FindNodeResponse(FindNodeResponse { peers }))
}

pub fn add_provider_request(request_id: u64, key: Vec<u8>, provider: PeerRecord) -> Envelope {
    Envelope::new(
        request_id,
        Payload::AddProviderRequest(AddProviderRequest {
            key,
            provider: Some(provider),
        }),
    )
}

pub fn get_providers_request(request_id: u64, key: Vec<u8>) -> Envelope {
    Envelope::new(request_id, Payload::GetProvidersRequest(GetProvidersRequest { key }))
}

pub fn ping_request(request_id: u64, nonce: u64) -> Envelope {
    Envelope::new(request_id, Payload::PingRequest(PingRequest { nonce }))
}

pub fn error_response(request_id: u64, code: u32, message: String) -> Envelope {
    Envelope::new(
        request_id,
        Payload::ErrorResponse(ErrorResponse { code, message }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let origin = PeerInfo::new(PeerId::from_public_key(b"a"), vec![Multiaddr::memory(1)]);
        let original = find_node_request(42, vec![7u8; 32]).with_origin(&origin);
        let bytes = original.to_bytes();
        let decoded = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(original, decoded);
        let origin_back = PeerInfo::try_from(decoded.origin.unwrap()).unwrap();
        assert_eq!(origin_back, origin);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut envelope = ping_request(1, 9);
        envelope.version = 99;
        let err = Envelope::from_bytes(&envelope.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { actual: 99, .. }));
    }

    #[test]
    fn test_peer_infos_drops_bad_records() {
        let good = PeerRecord {
            peer_id: vec![1u8; 32],
            addrs: vec!["/memory/4".to_string(), "not-an-addr".to_string()],
        };
        let bad = PeerRecord {
            peer_id: vec![1u8; 5],
            addrs: vec![],
        };
        let infos = peer_infos(vec![good, bad]);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].addrs, vec![Multiaddr::memory(4)]);
    }
}
