//! Shortlist state for iterative Kademlia lookups
//!
//! The shortlist holds the closest known candidates to a target key. The
//! engine repeatedly asks it for the next round of peers to query and feeds
//! the answers back as they arrive.

use crate::routing::xor_distance;
use std::collections::HashSet;
use tessera_core::{peer_key, Key, PeerId, PeerInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotQueried,
    Waiting,
    Succeeded,
}

#[derive(Debug, Clone)]
struct Candidate {
    info: PeerInfo,
    distance: Key,
    state: State,
}

#[derive(Debug)]
pub struct Shortlist {
    target: Key,
    capacity: usize,
    /// Closest candidates first; failed peers are removed
    candidates: Vec<Candidate>,
    /// Every peer ever considered, including ourselves and failed peers
    seen: HashSet<PeerId>,
    /// Distance of the closest candidate after the previous round
    best: Option<Key>,
    /// Rounds handed out so far
    rounds: usize,
}

impl Shortlist {
    pub fn new(target: Key, capacity: usize, local_id: PeerId, seeds: Vec<PeerInfo>) -> Self {
        let mut shortlist = Self {
            target,
            capacity,
            candidates: Vec::with_capacity(capacity),
            seen: HashSet::from([local_id]),
            best: None,
            rounds: 0,
        };
        shortlist.insert(seeds);
        shortlist.best = shortlist.closest_distance();
        shortlist
    }

    /// Merge newly learned peers, keeping the closest `capacity`
    pub fn insert(&mut self, peers: Vec<PeerInfo>) {
        for info in peers {
            if info.addrs.is_empty() || !self.seen.insert(info.peer_id) {
                continue;
            }
            let distance = xor_distance(&peer_key(&info.peer_id), &self.target);
            self.candidates.push(Candidate {
                info,
                distance,
                state: State::NotQueried,
            });
        }
        self.candidates.sort_by_key(|c| c.distance);
        self.candidates.truncate(self.capacity);
    }

    /// Candidates to query in the next round; empty once the lookup is over
    ///
    /// A round takes up to `alpha` of the closest unqueried candidates. When
    /// the previous round brought no closer candidate, the round takes every
    /// unqueried candidate instead. The lookup is over when nothing in the
    /// shortlist is left unqueried.
    pub fn next_round(&mut self, alpha: usize) -> Vec<PeerInfo> {
        let limit = if self.rounds > 0 && !self.improved() {
            usize::MAX
        } else {
            alpha
        };
        self.rounds += 1;
        self.take_unqueried(limit)
    }

    fn take_unqueried(&mut self, limit: usize) -> Vec<PeerInfo> {
        self.candidates
            .iter_mut()
            .filter(|c| c.state == State::NotQueried)
            .take(limit)
            .map(|c| {
                c.state = State::Waiting;
                c.info.clone()
            })
            .collect()
    }

    /// Record an answer from `peer_id` carrying closer peers
    pub fn on_success(&mut self, peer_id: &PeerId, learned: Vec<PeerInfo>) {
        if let Some(c) = self.candidates.iter_mut().find(|c| &c.info.peer_id == peer_id) {
            c.state = State::Succeeded;
        }
        self.insert(learned);
    }

    /// Drop a peer that failed to answer; it is never re-added
    pub fn on_failure(&mut self, peer_id: &PeerId) {
        self.candidates.retain(|c| &c.info.peer_id != peer_id);
    }

    /// Whether the closest candidate got closer since the last call
    fn improved(&mut self) -> bool {
        let current = self.closest_distance();
        let improved = match (current, self.best) {
            (Some(current), Some(best)) => current < best,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if improved {
            self.best = current;
        }
        improved
    }

    fn closest_distance(&self) -> Option<Key> {
        self.candidates.first().map(|c| c.distance)
    }

    /// Peers that answered, closest first
    pub fn succeeded(&self) -> Vec<PeerInfo> {
        self.candidates
            .iter()
            .filter(|c| c.state == State::Succeeded)
            .map(|c| c.info.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Multiaddr;

    fn peer_at(distance_byte: u8) -> PeerInfo {
        let mut bytes = [0u8; 32];
        bytes[0] = distance_byte;
        PeerInfo::new(PeerId::from_bytes(bytes), vec![Multiaddr::memory(distance_byte as u64)])
    }

    fn local() -> PeerId {
        PeerId::from_bytes([0xff; 32])
    }

    #[test]
    fn test_rounds_take_closest_first() {
        let seeds = vec![peer_at(40), peer_at(10), peer_at(30), peer_at(20)];
        let mut shortlist = Shortlist::new([0u8; 32], 20, local(), seeds);

        let round = shortlist.next_round(3);
        assert_eq!(round, vec![peer_at(10), peer_at(20), peer_at(30)]);
        shortlist.on_success(&peer_at(10).peer_id, vec![peer_at(5)]);
        shortlist.on_success(&peer_at(20).peer_id, vec![]);
        shortlist.on_success(&peer_at(30).peer_id, vec![]);

        // Improved, so the next round stays at alpha
        assert_eq!(shortlist.next_round(1), vec![peer_at(5)]);
    }

    #[test]
    fn test_capacity_keeps_closest() {
        let seeds = (1..=10).map(peer_at).collect();
        let mut shortlist = Shortlist::new([0u8; 32], 4, local(), seeds);
        assert_eq!(shortlist.len(), 4);
        assert_eq!(shortlist.next_round(10), (1..=4).map(peer_at).collect::<Vec<_>>());
    }

    #[test]
    fn test_ignores_self_and_duplicates() {
        let me = PeerInfo::new(local(), vec![Multiaddr::memory(99)]);
        let mut shortlist = Shortlist::new([0u8; 32], 20, local(), vec![me, peer_at(5)]);
        shortlist.insert(vec![peer_at(5)]);
        assert_eq!(shortlist.len(), 1);
    }

    #[test]
    fn test_improvement_tracking() {
        let mut shortlist = Shortlist::new([0u8; 32], 20, local(), vec![peer_at(50)]);
        let round = shortlist.next_round(3);
        shortlist.on_success(&round[0].peer_id, vec![peer_at(10)]);
        assert!(shortlist.improved());

        let round = shortlist.next_round(3);
        shortlist.on_success(&round[0].peer_id, vec![peer_at(60)]);
        assert!(!shortlist.improved());
    }

    #[test]
    fn test_stalled_round_widens_until_nothing_is_unqueried() {
        let mut shortlist = Shortlist::new([0u8; 32], 20, local(), vec![peer_at(50)]);
        assert_eq!(shortlist.next_round(1), vec![peer_at(50)]);
        shortlist.on_success(&peer_at(50).peer_id, vec![peer_at(60), peer_at(70)]);

        // No closer candidate: every unqueried candidate at once, ignoring alpha
        assert_eq!(shortlist.next_round(1), vec![peer_at(60), peer_at(70)]);
        shortlist.on_success(&peer_at(60).peer_id, vec![peer_at(80)]);
        shortlist.on_success(&peer_at(70).peer_id, vec![]);

        // A peer learned in the widened round is still queried
        assert_eq!(shortlist.next_round(1), vec![peer_at(80)]);
        shortlist.on_success(&peer_at(80).peer_id, vec![]);
        assert!(shortlist.next_round(1).is_empty());
        assert_eq!(
            shortlist.succeeded(),
            vec![peer_at(50), peer_at(60), peer_at(70), peer_at(80)]
        );
    }

    #[test]
    fn test_failed_peers_are_not_readded() {
        let mut shortlist = Shortlist::new([0u8; 32], 20, local(), vec![peer_at(5), peer_at(6)]);
        let round = shortlist.next_round(2);
        shortlist.on_failure(&round[0].peer_id);
        shortlist.on_success(&round[1].peer_id, vec![peer_at(5)]);

        assert_eq!(shortlist.len(), 1);
        assert_eq!(shortlist.succeeded(), vec![peer_at(6)]);
        assert!(shortlist.next_round(2).is_empty());
    }
}
