//! Kademlia routing table implementation

use bitvec::prelude::*;
use std::collections::VecDeque;
use std::time::Instant;
use tessera_core::{peer_key, Key, PeerId, PeerInfo};

/// XOR distance between two keys
pub fn xor_distance(a: &Key, b: &Key) -> Key {
    let mut result = [0u8; 32];
    for i in 0..32 {
        result[i] = a[i] ^ b[i];
    }
    result
}

/// Find the index of the most significant bit that differs
pub fn bucket_index(distance: &Key) -> usize {
    let leading = distance.view_bits::<Msb0>().leading_zeros();
    if leading == 256 {
        return 0;
    }
    255 - leading
}

/// A peer in the routing table
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub info: PeerInfo,
    pub last_seen: Instant,
    /// Consecutive failed exchanges
    pub failures: u32,
}

/// Result of recording a contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New entry added
    Inserted,
    /// Existing entry refreshed
    Updated,
    /// Bucket is full; the caller decides whether `oldest` gets replaced
    Full { oldest: PeerInfo },
    /// Our own id, or a peer without addresses
    Ignored,
}

/// A k-bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Maximum number of nodes in this bucket
    k: usize,
    /// Nodes in this bucket, ordered by last seen (most recent at back)
    entries: VecDeque<RoutingEntry>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            entries: VecDeque::with_capacity(k),
        }
    }

    /// Add or update a node in the bucket
    pub fn upsert(&mut self, info: PeerInfo) -> InsertOutcome {
        // Check if node already exists
        if let Some(pos) = self.position(&info.peer_id) {
            // Move to back (most recently seen)
            if let Some(mut entry) = self.entries.remove(pos) {
                entry.info.merge_addrs(&info.addrs);
                entry.last_seen = Instant::now();
                entry.failures = 0;
                self.entries.push_back(entry);
            }
            return InsertOutcome::Updated;
        }

        // Add new node if space available
        if self.entries.len() < self.k {
            self.entries.push_back(RoutingEntry {
                info,
                last_seen: Instant::now(),
                failures: 0,
            });
            return InsertOutcome::Inserted;
        }

        match self.entries.front() {
            Some(oldest) => InsertOutcome::Full {
                oldest: oldest.info.clone(),
            },
            None => InsertOutcome::Ignored,
        }
    }

    fn position(&self, peer_id: &PeerId) -> Option<usize> {
        self.entries.iter().position(|e| &e.info.peer_id == peer_id)
    }

    fn remove(&mut self, peer_id: &PeerId) -> Option<RoutingEntry> {
        let pos = self.position(peer_id)?;
        self.entries.remove(pos)
    }

    /// Get all entries in the bucket, least recently seen first
    pub fn entries(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Kademlia routing table
pub struct RoutingTable {
    /// Our node ID
    local_id: PeerId,
    local_key: Key,
    /// K-buckets (256 buckets for 256-bit IDs)
    buckets: Vec<KBucket>,
    /// Failures after which an entry is evicted
    max_failures: u32,
}

impl RoutingTable {
    pub fn new(local_id: PeerId, k: usize, max_failures: u32) -> Self {
        Self {
            local_id,
            local_key: peer_key(&local_id),
            buckets: (0..256).map(|_| KBucket::new(k)).collect(),
            max_failures,
        }
    }

    fn bucket_for(&self, peer_id: &PeerId) -> usize {
        bucket_index(&xor_distance(&self.local_key, &peer_key(peer_id)))
    }

    /// Insert or refresh a contact
    pub fn record_contact(&mut self, info: PeerInfo) -> InsertOutcome {
        if info.peer_id == self.local_id || info.addrs.is_empty() {
            return InsertOutcome::Ignored;
        }
        let idx = self.bucket_for(&info.peer_id);
        self.buckets[idx].upsert(info)
    }

    /// Replace a full bucket's unresponsive oldest entry with a candidate
    ///
    /// Returns false if `oldest` is gone or the candidate no longer fits.
    pub fn replace(&mut self, oldest: &PeerId, candidate: PeerInfo) -> bool {
        let idx = self.bucket_for(oldest);
        if self.bucket_for(&candidate.peer_id) != idx {
            return false;
        }
        if self.buckets[idx].remove(oldest).is_none() {
            return false;
        }
        tracing::debug!("Evicted {:?} in favour of {:?}", oldest, candidate.peer_id);
        matches!(
            self.buckets[idx].upsert(candidate),
            InsertOutcome::Inserted | InsertOutcome::Updated
        )
    }

    /// Count a failed exchange; returns true if the peer was evicted
    pub fn record_failure(&mut self, peer_id: &PeerId) -> bool {
        let idx = self.bucket_for(peer_id);
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.position(peer_id) else {
            return false;
        };
        bucket.entries[pos].failures += 1;
        if bucket.entries[pos].failures >= self.max_failures {
            bucket.entries.remove(pos);
            tracing::debug!("Evicted unreachable peer {:?}", peer_id);
            return true;
        }
        false
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        let idx = self.bucket_for(peer_id);
        self.buckets[idx].remove(peer_id).map(|e| e.info)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&RoutingEntry> {
        let idx = self.bucket_for(peer_id);
        self.buckets[idx].entries().find(|e| &e.info.peer_id == peer_id)
    }

    /// Find the `count` closest nodes to a target
    pub fn closest_peers(&self, target: &Key, count: usize) -> Vec<PeerInfo> {
        let mut all_nodes: Vec<_> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries())
            .map(|e| e.info.clone())
            .collect();

        // Sort by distance to target
        all_nodes.sort_by_key(|n| xor_distance(&peer_key(&n.peer_id), target));

        all_nodes.truncate(count);
        all_nodes
    }

    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(index)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Multiaddr;

    fn peer(seed: u32) -> PeerInfo {
        PeerInfo::new(
            PeerId::from_public_key(&seed.to_le_bytes()),
            vec![Multiaddr::memory(seed as u64)],
        )
    }

    /// A peer that lands in `bucket` (>= 8) of `local`'s table; `salt` varies the low byte
    fn peer_in_bucket(local: &PeerId, bucket: usize, salt: u8) -> PeerInfo {
        let mut bytes = *local.as_bytes();
        let bit = 255 - bucket;
        bytes[bit / 8] ^= 0x80 >> (bit % 8);
        bytes[31] ^= salt;
        PeerInfo::new(PeerId::from_bytes(bytes), vec![Multiaddr::memory(salt as u64)])
    }

    #[test]
    fn test_xor_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[31] = 1;

        let dist = xor_distance(&a, &b);
        assert_eq!(dist[31], 1);
    }

    #[test]
    fn test_bucket_index() {
        let mut dist = [0u8; 32];
        dist[31] = 1;
        assert_eq!(bucket_index(&dist), 0);

        dist[31] = 0x80;
        assert_eq!(bucket_index(&dist), 7);

        dist[0] = 0x80;
        dist[31] = 0;
        assert_eq!(bucket_index(&dist), 255);
    }

    #[test]
    fn test_local_and_addressless_peers_ignored() {
        let local = peer(0);
        let mut table = RoutingTable::new(local.peer_id, 20, 3);
        assert_eq!(table.record_contact(local.clone()), InsertOutcome::Ignored);
        let no_addrs = PeerInfo::new(peer(1).peer_id, vec![]);
        assert_eq!(table.record_contact(no_addrs), InsertOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn test_bucket_never_exceeds_k() {
        let local = peer(0).peer_id;
        let k = 4;
        let mut table = RoutingTable::new(local, k, 3);

        let mut full_seen = 0;
        for salt in 1..=40u8 {
            match table.record_contact(peer_in_bucket(&local, 200, salt)) {
                InsertOutcome::Full { .. } => full_seen += 1,
                InsertOutcome::Inserted => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        for i in 1..500u32 {
            table.record_contact(peer(i));
        }

        for idx in 0..256 {
            assert!(table.bucket(idx).unwrap().len() <= k);
        }
        assert_eq!(table.bucket(200).unwrap().len(), k);
        assert_eq!(full_seen, 40 - k);
    }

    #[test]
    fn test_full_bucket_reports_least_recently_seen() {
        let local = peer(0).peer_id;
        let mut table = RoutingTable::new(local, 2, 3);
        let first = peer_in_bucket(&local, 100, 1);
        let second = peer_in_bucket(&local, 100, 2);
        let third = peer_in_bucket(&local, 100, 3);

        table.record_contact(first.clone());
        table.record_contact(second.clone());
        // Refreshing `first` makes `second` the oldest
        assert_eq!(table.record_contact(first.clone()), InsertOutcome::Updated);
        assert_eq!(
            table.record_contact(third.clone()),
            InsertOutcome::Full { oldest: second.clone() }
        );

        assert!(table.replace(&second.peer_id, third.clone()));
        assert!(table.get(&second.peer_id).is_none());
        assert!(table.get(&third.peer_id).is_some());
        assert!(!table.replace(&second.peer_id, third));
    }

    #[test]
    fn test_repeated_failures_evict() {
        let local = peer(0).peer_id;
        let mut table = RoutingTable::new(local, 20, 3);
        let remote = peer(7);
        table.record_contact(remote.clone());

        assert!(!table.record_failure(&remote.peer_id));
        assert!(!table.record_failure(&remote.peer_id));
        // A successful exchange resets the count
        assert_eq!(table.record_contact(remote.clone()), InsertOutcome::Updated);
        assert!(!table.record_failure(&remote.peer_id));
        assert!(!table.record_failure(&remote.peer_id));
        assert!(table.record_failure(&remote.peer_id));
        assert!(table.get(&remote.peer_id).is_none());
    }

    #[test]
    fn test_closest_peers_sorted_by_distance() {
        let local = peer(0).peer_id;
        let mut table = RoutingTable::new(local, 20, 3);
        for i in 1..300u32 {
            table.record_contact(peer(i));
        }
        let target = *PeerId::from_public_key(b"target").as_bytes();

        let closest = table.closest_peers(&target, 25);
        assert_eq!(closest.len(), 25);
        let distances: Vec<Key> = closest
            .iter()
            .map(|p| xor_distance(p.peer_id.as_bytes(), &target))
            .collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));

        // Nothing in the table is closer than the last returned entry
        let all = table.closest_peers(&target, usize::MAX);
        assert_eq!(&all[..25], &closest[..]);
    }

    #[test]
    fn test_remove_peer() {
        let local = peer(0).peer_id;
        let mut table = RoutingTable::new(local, 20, 3);
        let remote = peer(3);
        table.record_contact(remote.clone());
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove_peer(&remote.peer_id), Some(remote));
        assert!(table.is_empty());
    }
}
