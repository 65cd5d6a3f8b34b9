//! Tessera PubSub - flood-based topic messaging
//!
//! Every node forwards each new message to its connected peers and drops
//! messages it has already seen, so a message reaches every connected
//! component of the overlay exactly once per node.

pub mod floodsub;
pub mod seen;

pub use floodsub::{FloodSub, Message, MessageHandler};
pub use seen::{MessageId, SeenCache};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PubSubError {
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error(transparent)]
    Core(#[from] tessera_core::Error),
}

pub type Result<T> = std::result::Result<T, PubSubError>;

/// Which connected peers a message is forwarded to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloodPolicy {
    /// Every connected peer, whatever it subscribed to
    #[default]
    AllPeers,
    /// Only peers that announced one of the message's topics
    Interested,
}

impl FromStr for FloodPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "all-peers" | "all" => Ok(Self::AllPeers),
            "interested" => Ok(Self::Interested),
            other => Err(format!("unknown flood policy: {}", other)),
        }
    }
}

impl fmt::Display for FloodPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllPeers => write!(f, "all-peers"),
            Self::Interested => write!(f, "interested"),
        }
    }
}

/// PubSub configuration
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub flood_policy: FloodPolicy,
    /// How long a message id is remembered for deduplication
    pub seen_ttl: Duration,
    /// Maximum number of remembered message ids
    pub seen_capacity: usize,
    /// Largest accepted payload
    pub max_message_size: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            flood_policy: FloodPolicy::AllPeers,
            seen_ttl: Duration::from_secs(120),
            seen_capacity: 10_000,
            max_message_size: 1024 * 1024,
        }
    }
}
