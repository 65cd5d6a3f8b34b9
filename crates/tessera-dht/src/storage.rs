//! DHT storage for content key to provider mappings

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tessera_core::{Key, PeerId, PeerInfo};

/// An assertion that `provider` can supply the content behind `key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    pub key: Key,
    pub provider: PeerInfo,
    pub expires_at: Instant,
}

impl ProviderRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Storage for provider records
pub struct ProviderStore {
    /// Map from content key to its providers
    entries: HashMap<Key, Vec<ProviderRecord>>,
    /// Maximum providers per content key
    max_providers_per_key: usize,
    /// Lifetime of a record from its latest announcement
    ttl: Duration,
}

impl ProviderStore {
    pub fn new(max_providers_per_key: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_providers_per_key,
            ttl,
        }
    }

    /// Store a provider for a key
    ///
    /// Announcing again from the same peer refreshes the existing record.
    pub fn add_provider(&mut self, key: Key, provider: PeerInfo, now: Instant) {
        let expires_at = now + self.ttl;
        let records = self.entries.entry(key).or_default();
        records.retain(|r| !r.is_expired(now));

        // Check if provider already exists
        if let Some(existing) = records
            .iter_mut()
            .find(|r| r.provider.peer_id == provider.peer_id)
        {
            existing.provider.merge_addrs(&provider.addrs);
            existing.expires_at = expires_at;
            return;
        }

        let record = ProviderRecord {
            key,
            provider,
            expires_at,
        };

        // Add new provider if space available
        if records.len() < self.max_providers_per_key {
            records.push(record);
        } else {
            // Replace the record closest to expiry
            records.sort_by_key(|r| r.expires_at);
            if let Some(oldest) = records.first_mut() {
                *oldest = record;
            }
        }
    }

    /// Unexpired providers for a key
    pub fn providers(&self, key: &Key, now: Instant) -> Vec<PeerInfo> {
        self.entries
            .get(key)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| !r.is_expired(now))
                    .map(|r| r.provider.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove_provider(&mut self, key: &Key, peer_id: &PeerId) -> bool {
        let Some(records) = self.entries.get_mut(key) else {
            return false;
        };
        let before = records.len();
        records.retain(|r| &r.provider.peer_id != peer_id);
        let removed = records.len() != before;
        if records.is_empty() {
            self.entries.remove(key);
        }
        removed
    }

    /// Remove expired records; returns how many were dropped
    pub fn cleanup(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for records in self.entries.values_mut() {
            let before = records.len();
            records.retain(|r| !r.is_expired(now));
            removed += before - records.len();
        }
        self.entries.retain(|_, v| !v.is_empty());
        removed
    }

    /// Number of stored records, expired or not
    pub fn len(&self) -> usize {
        self.entries.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Multiaddr;

    fn provider(seed: &[u8], port: u64) -> PeerInfo {
        PeerInfo::new(PeerId::from_public_key(seed), vec![Multiaddr::memory(port)])
    }

    #[test]
    fn test_store_and_get() {
        let mut storage = ProviderStore::new(10, Duration::from_secs(60));
        let key = [1u8; 32];
        let now = Instant::now();

        storage.add_provider(key, provider(b"a", 1), now);

        let providers = storage.providers(&key, now);
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0], provider(b"a", 1));
        assert!(storage.providers(&[2u8; 32], now).is_empty());
    }

    #[test]
    fn test_reannounce_is_idempotent() {
        let mut storage = ProviderStore::new(10, Duration::from_secs(60));
        let key = [1u8; 32];
        let now = Instant::now();

        storage.add_provider(key, provider(b"a", 1), now);
        storage.add_provider(key, provider(b"a", 1), now + Duration::from_secs(30));

        assert_eq!(storage.len(), 1);
        // The second announcement pushed the expiry out
        let later = now + Duration::from_secs(75);
        assert_eq!(storage.providers(&key, later), vec![provider(b"a", 1)]);
    }

    #[test]
    fn test_expired_records_are_absent() {
        let mut storage = ProviderStore::new(10, Duration::from_secs(60));
        let key = [1u8; 32];
        let now = Instant::now();

        storage.add_provider(key, provider(b"a", 1), now);
        storage.add_provider(key, provider(b"b", 2), now + Duration::from_secs(30));

        let later = now + Duration::from_secs(61);
        assert_eq!(storage.providers(&key, later), vec![provider(b"b", 2)]);
        assert_eq!(storage.cleanup(later), 1);
        assert_eq!(storage.cleanup(now + Duration::from_secs(120)), 1);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_capacity_replaces_oldest() {
        let mut storage = ProviderStore::new(2, Duration::from_secs(60));
        let key = [1u8; 32];
        let now = Instant::now();

        storage.add_provider(key, provider(b"a", 1), now);
        storage.add_provider(key, provider(b"b", 2), now + Duration::from_secs(1));
        storage.add_provider(key, provider(b"c", 3), now + Duration::from_secs(2));

        let providers = storage.providers(&key, now + Duration::from_secs(2));
        assert_eq!(providers.len(), 2);
        assert!(!providers.contains(&provider(b"a", 1)));
    }

    #[test]
    fn test_remove_provider() {
        let mut storage = ProviderStore::new(10, Duration::from_secs(60));
        let key = [1u8; 32];
        let a = provider(b"a", 1);
        storage.add_provider(key, a.clone(), Instant::now());

        assert!(storage.remove_provider(&key, &a.peer_id));
        assert!(!storage.remove_provider(&key, &a.peer_id));
        assert!(storage.is_empty());
    }
}
