//! Peer identities and transport addresses

use crate::{Error, Result};
use libp2p_identity::PeerId as P2pId;
use multiaddr::Protocol;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// A 32-byte peer identifier, the BLAKE3 digest of a public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive a peer id from public key bytes
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    /// Generate a random peer id for an ephemeral node
    pub fn random() -> Result<Self> {
        let mut id = [0u8; 32];
        getrandom::getrandom(&mut id)
            .map_err(|e| Error::InvalidPeerId(format!("random generation failed: {}", e)))?;
        Ok(Self(id))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a peer id from a wire-format byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let id: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::InvalidPeerId(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..12])
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidPeerId(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// Multihash code our 32-byte ids are embedded under in `/p2p/` components
const IDENTITY_MULTIHASH: u8 = 0x00;

impl PeerId {
    fn to_p2p(self) -> Result<P2pId> {
        let mut bytes = Vec::with_capacity(34);
        bytes.extend_from_slice(&[IDENTITY_MULTIHASH, 32]);
        bytes.extend_from_slice(&self.0);
        P2pId::from_bytes(&bytes).map_err(|e| Error::InvalidPeerId(e.to_string()))
    }

    fn from_p2p(id: &P2pId) -> Result<Self> {
        let bytes = id.to_bytes();
        match bytes.split_first_chunk::<2>() {
            Some(([IDENTITY_MULTIHASH, 32], digest)) => Self::from_slice(digest),
            _ => Err(Error::InvalidPeerId(format!("unsupported peer id {}", id))),
        }
    }
}

/// A transport address such as `/ip4/127.0.0.1/tcp/9876` or `/memory/3`,
/// optionally suffixed with `/p2p/<peer id>`
///
/// Only TCP over IPv4/IPv6 and in-memory addresses are accepted.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Multiaddr(multiaddr::Multiaddr);

impl Multiaddr {
    /// Address of an in-memory listener
    pub fn memory(port: u64) -> Self {
        Self(multiaddr::Multiaddr::empty().with(Protocol::Memory(port)))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Self(
            multiaddr::Multiaddr::empty()
                .with(ip)
                .with(Protocol::Tcp(addr.port())),
        )
    }

    /// Append a `/p2p/<peer id>` suffix, replacing any existing one
    pub fn with_peer_id(&self, peer_id: &PeerId) -> Result<Self> {
        let base = self.without_peer_id();
        Ok(Self(base.0.with(Protocol::P2p(peer_id.to_p2p()?))))
    }

    /// The peer id named by a `/p2p/` suffix, if any
    pub fn peer_id(&self) -> Option<PeerId> {
        self.0.iter().find_map(|p| match p {
            Protocol::P2p(id) => PeerId::from_p2p(&id).ok(),
            _ => None,
        })
    }

    /// The address with any `/p2p/` suffix removed
    pub fn without_peer_id(&self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|p| !matches!(p, Protocol::P2p(_)))
                .collect(),
        )
    }

    /// Socket address of a `/ip4/../tcp/..` or `/ip6/../tcp/..` address
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        let mut stack = self.0.iter();
        match (stack.next(), stack.next()) {
            (Some(Protocol::Ip4(ip)), Some(Protocol::Tcp(port))) => {
                Ok(SocketAddr::new(IpAddr::V4(ip), port))
            }
            (Some(Protocol::Ip6(ip)), Some(Protocol::Tcp(port))) => {
                Ok(SocketAddr::new(IpAddr::V6(ip), port))
            }
            _ => Err(Error::InvalidAddress(format!("{} is not a TCP address", self))),
        }
    }

    /// Port of a `/memory/<n>` address
    pub fn memory_port(&self) -> Option<u64> {
        match self.0.iter().next() {
            Some(Protocol::Memory(port)) => Some(port),
            _ => None,
        }
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({})", self.0)
    }
}

impl FromStr for Multiaddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidAddress(format!("{}: {}", s, reason));
        let addr: multiaddr::Multiaddr = s.parse().map_err(|e: multiaddr::Error| invalid(e.to_string()))?;

        let supported = {
            let stack: Vec<Protocol<'_>> = addr.iter().collect();
            let base = match stack.as_slice() {
                [base @ .., Protocol::P2p(id)] => {
                    PeerId::from_p2p(id).map_err(|e| invalid(e.to_string()))?;
                    base
                }
                all => all,
            };
            matches!(
                base,
                [Protocol::Ip4(_) | Protocol::Ip6(_), Protocol::Tcp(_)] | [Protocol::Memory(_)]
            )
        };
        if !supported {
            return Err(invalid("unsupported protocol stack".to_string()));
        }
        Ok(Self(addr))
    }
}

/// A peer together with the addresses it can be reached at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Merge addresses from another record for the same peer, newest first
    pub fn merge_addrs(&mut self, addrs: &[Multiaddr]) {
        for addr in addrs.iter().rev() {
            if let Some(pos) = self.addrs.iter().position(|a| a == addr) {
                self.addrs.remove(pos);
            }
            self.addrs.insert(0, addr.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = PeerId::from_public_key(b"some public key");
        let parsed: PeerId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("abcd".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_multiaddr_tcp() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/9876".parse().unwrap();
        assert_eq!(addr.to_socket_addr().unwrap(), "127.0.0.1:9876".parse().unwrap());
        assert!(addr.peer_id().is_none());
        assert!(addr.memory_port().is_none());
    }

    #[test]
    fn test_multiaddr_peer_suffix() {
        let id = PeerId::from_public_key(b"bootstrap");
        let addr = Multiaddr::memory(7).with_peer_id(&id).unwrap();
        let parsed: Multiaddr = addr.to_string().parse().unwrap();
        assert_eq!(parsed.peer_id(), Some(id));
        assert_eq!(parsed.without_peer_id(), Multiaddr::memory(7));
        assert_eq!(parsed.memory_port(), Some(7));

        // A second suffix replaces the first
        let other = PeerId::from_public_key(b"other");
        assert_eq!(parsed.with_peer_id(&other).unwrap().peer_id(), Some(other));
    }

    #[test]
    fn test_multiaddr_from_socket_addr() {
        let v6 = Multiaddr::from_socket_addr("[::1]:4001".parse().unwrap());
        assert_eq!(v6.to_string(), "/ip6/::1/tcp/4001");
        assert_eq!(v6.to_socket_addr().unwrap(), "[::1]:4001".parse().unwrap());
        assert!(Multiaddr::memory(3).to_socket_addr().is_err());
    }

    #[test]
    fn test_multiaddr_rejects_garbage() {
        assert!("".parse::<Multiaddr>().is_err());
        assert!("ip4/1.2.3.4/tcp/1".parse::<Multiaddr>().is_err());
        assert!("/ip4/::1/tcp/1".parse::<Multiaddr>().is_err());
        assert!("/ip4/1.2.3.4/udp/1".parse::<Multiaddr>().is_err());
        assert!("/memory/1/p2p/zz".parse::<Multiaddr>().is_err());
        assert!("/ip4/1.2.3.4/tcp/1/tcp/2".parse::<Multiaddr>().is_err());
        // Well-formed multiaddrs outside the supported stacks
        assert!("/dns4/example.com/tcp/1".parse::<Multiaddr>().is_err());
        assert!("/ip4/1.2.3.4/udp/1/quic-v1".parse::<Multiaddr>().is_err());
    }

    #[test]
    fn test_merge_addrs_dedups() {
        let id = PeerId::from_public_key(b"x");
        let mut info = PeerInfo::new(id, vec![Multiaddr::memory(1), Multiaddr::memory(2)]);
        info.merge_addrs(&[Multiaddr::memory(2), Multiaddr::memory(3)]);
        assert_eq!(
            info.addrs,
            vec![Multiaddr::memory(2), Multiaddr::memory(3), Multiaddr::memory(1)]
        );
    }
}
