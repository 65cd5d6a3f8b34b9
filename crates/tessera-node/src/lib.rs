//! Tessera Node Library
//!
//! Wires a transport, the Kademlia DHT and the FloodSub router into one
//! overlay node, and loads the node's TOML configuration.

pub mod config;
pub mod node;

pub use config::Config;
pub use node::{Node, NodeConfig};
