//! Tessera DHT - Kademlia DHT over the Tessera transport
//!
//! This crate provides a distributed hash table for content routing,
//! mapping content ids to the peers that provide them, and for peer routing.

pub mod kademlia;
pub mod lookup;
pub mod routing;
pub mod storage;

pub use kademlia::Kademlia;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::Duration;
use tessera_core::PeerId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Peer unreachable: {0:?}")]
    PeerUnreachable(PeerId),

    #[error("No peers reachable")]
    NoPeersReachable,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error(transparent)]
    Core(#[from] tessera_core::Error),
}

pub type Result<T> = std::result::Result<T, DhtError>;

/// DHT node configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Number of nodes per k-bucket, and replication factor of provider records
    pub k: usize,
    /// Parallelism factor for lookups
    pub alpha: usize,
    /// Timeout of a single request to one peer
    pub query_timeout: Duration,
    /// Timeout of a whole iterative lookup
    pub lookup_timeout: Duration,
    /// Timeout of the liveness ping sent to the oldest entry of a full bucket
    pub ping_timeout: Duration,
    /// Consecutive failures after which a routing entry is evicted
    pub max_failures: u32,
    /// How long a provider record stays valid
    pub provider_ttl: Duration,
    /// How often an active provide obligation is re-announced
    pub republish_interval: Duration,
    /// How often expired provider records are purged
    pub cleanup_interval: Duration,
    /// Maximum providers stored per key
    pub max_providers_per_key: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            query_timeout: Duration::from_secs(10),
            lookup_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            max_failures: 3,
            provider_ttl: Duration::from_secs(24 * 60 * 60),
            republish_interval: Duration::from_secs(12 * 60 * 60),
            cleanup_interval: Duration::from_secs(60),
            max_providers_per_key: 20,
        }
    }
}

/// Request ID counter, initialized with a random offset to avoid collisions across sessions
static REQUEST_COUNTER: LazyLock<AtomicU64> = LazyLock::new(|| {
    let mut buf = [0u8; 8];
    // If getrandom fails, use current time as fallback
    if getrandom::getrandom(&mut buf).is_err() {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        return AtomicU64::new(ts);
    }
    AtomicU64::new(u64::from_le_bytes(buf))
});

/// Get a unique request ID
pub fn next_request_id() -> u64 {
    REQUEST_COUNTER.fetch_add(1, Ordering::SeqCst)
}
