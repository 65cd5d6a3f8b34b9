//! Deduplication cache of recently seen message ids

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tessera_core::PeerId;

/// Identifies a message network-wide: its originator and sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub from: PeerId,
    pub seqno: u64,
}

impl MessageId {
    pub fn new(from: PeerId, seqno: u64) -> Self {
        Self { from, seqno }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.from, self.seqno)
    }
}

/// Bounded, time-windowed set of message ids
///
/// Ids are kept in arrival order; expired ids are dropped first and the
/// oldest id makes room when the cache is full.
#[derive(Debug)]
pub struct SeenCache {
    ttl: Duration,
    capacity: usize,
    order: VecDeque<(MessageId, Instant)>,
    seen: HashSet<MessageId>,
}

impl SeenCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Mark an id as seen
    ///
    /// Returns true if the id was not already in the cache.
    pub fn insert(&mut self, id: MessageId, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back((id, now));
        self.seen.insert(id);
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    /// Drop ids older than the TTL
    pub fn expire(&mut self, now: Instant) {
        while let Some((id, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
