//! Tessera Core - Shared types, protocols, and transport abstraction
//!
//! This crate provides the building blocks shared by the Tessera DHT and
//! pubsub engines: peer identities and addresses, the protobuf wire format,
//! length-delimited framing, and the transport collaborator trait.

pub mod address_book;
pub mod codec;
pub mod error;
pub mod identity;
pub mod proto;
pub mod tcp;
pub mod transport;
pub mod types;

pub use address_book::AddressBook;
pub use error::{Error, Result};
pub use identity::{Multiaddr, PeerId, PeerInfo};
pub use tcp::TcpTransport;
pub use transport::{InboundStream, Transport};
pub use types::*;

/// Protocol version carried in every envelope
pub const PROTOCOL_VERSION: u8 = 1;

/// Protocol id of the DHT request/response stream
pub const KAD_PROTOCOL: &str = "/tessera/kad/1.0.0";

/// Protocol id of the floodsub stream
pub const FLOODSUB_PROTOCOL: &str = "/tessera/floodsub/1.0.0";

/// Protocol id used when dialing an address to learn the remote peer id
pub const IDENTIFY_PROTOCOL: &str = "/tessera/id/1.0.0";

/// Largest frame accepted on any stream: 1 MiB
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
