//! Address book: known peers, their addresses, and which are connected
//!
//! Shared by the DHT (which learns addresses during lookups) and pubsub
//! (which floods to connected peers). Wrap it in [`SharedAddressBook`] and
//! keep critical sections short; never hold the lock across network I/O.

use crate::{Multiaddr, PeerId, PeerInfo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Maximum addresses remembered per peer
const MAX_ADDRS_PER_PEER: usize = 8;

/// Maximum peers remembered; beyond it the stalest disconnected peer goes
const MAX_KNOWN_PEERS: usize = 4096;

pub type SharedAddressBook = Arc<RwLock<AddressBook>>;

/// What we know about one remote peer
#[derive(Debug, Clone)]
pub struct AddressEntry {
    /// Known addresses, most recently learned first
    pub addrs: Vec<Multiaddr>,
    /// Whether we currently hold a session with the peer
    pub connected: bool,
    pub last_seen: Instant,
}

#[derive(Debug)]
pub struct AddressBook {
    local: PeerInfo,
    peers: HashMap<PeerId, AddressEntry>,
}

impl AddressBook {
    pub fn new(local: PeerInfo) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    pub fn shared(local: PeerInfo) -> SharedAddressBook {
        Arc::new(RwLock::new(Self::new(local)))
    }

    pub fn local(&self) -> &PeerInfo {
        &self.local
    }

    /// Remember addresses for a peer; our own id is ignored
    pub fn add_addrs(&mut self, peer: &PeerInfo) {
        if peer.peer_id == self.local.peer_id {
            return;
        }
        if !self.peers.contains_key(&peer.peer_id) && self.peers.len() >= MAX_KNOWN_PEERS {
            self.evict_stalest();
        }
        let entry = self.peers.entry(peer.peer_id).or_insert_with(|| AddressEntry {
            addrs: Vec::new(),
            connected: false,
            last_seen: Instant::now(),
        });
        merge(&mut entry.addrs, &peer.addrs);
        entry.last_seen = Instant::now();
    }

    /// Record a live session with a peer
    ///
    /// Returns true if the peer was not connected before.
    pub fn mark_connected(&mut self, peer: &PeerInfo) -> bool {
        if peer.peer_id == self.local.peer_id {
            return false;
        }
        self.add_addrs(peer);
        match self.peers.get_mut(&peer.peer_id) {
            Some(entry) => !std::mem::replace(&mut entry.connected, true),
            None => false,
        }
    }

    /// Returns true if the peer was connected
    pub fn mark_disconnected(&mut self, peer_id: &PeerId) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(entry) => std::mem::replace(&mut entry.connected, false),
            None => false,
        }
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers.get(peer_id).is_some_and(|e| e.connected)
    }

    pub fn peer_info(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers
            .get(peer_id)
            .map(|e| PeerInfo::new(*peer_id, e.addrs.clone()))
    }

    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .filter(|(_, e)| e.connected)
            .map(|(id, e)| PeerInfo::new(*id, e.addrs.clone()))
            .collect()
    }

    /// Drop a peer that is not connected; returns true if it was removed
    pub fn forget(&mut self, peer_id: &PeerId) -> bool {
        if self.is_connected(peer_id) {
            return false;
        }
        self.peers.remove(peer_id).is_some()
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .peers
            .iter()
            .filter(|(_, e)| !e.connected)
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(id, _)| *id);
        if let Some(id) = stalest {
            self.peers.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn merge(existing: &mut Vec<Multiaddr>, learned: &[Multiaddr]) {
    for addr in learned.iter().rev() {
        existing.retain(|a| a != addr);
        existing.insert(0, addr.clone());
    }
    existing.truncate(MAX_ADDRS_PER_PEER);
}
