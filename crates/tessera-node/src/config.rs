//! Node configuration

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tessera_core::{Multiaddr, PeerId};
use tessera_dht::DhtConfig;
use tessera_pubsub::{FloodPolicy, PubSubConfig};

/// Default location of the config file
pub const DEFAULT_CONFIG_PATH: &str = "~/.tessera/config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeSection,
    pub dht: DhtSection,
    pub pubsub: PubSubSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Address to listen on
    pub listen: String,
    /// Peers to dial on startup
    pub bootstrap: Vec<String>,
    /// Seed the peer id is derived from; a random id is used when unset
    pub identity: Option<String>,
    /// Address advertised to other peers instead of the listen address
    pub external_addr: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen: "/ip4/127.0.0.1/tcp/4001".to_string(),
            bootstrap: vec![],
            identity: None,
            external_addr: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSection {
    /// K parameter (nodes per bucket)
    pub k: usize,
    /// Alpha parameter (lookup parallelism)
    pub alpha: usize,
    pub query_timeout_secs: u64,
    pub lookup_timeout_secs: u64,
    pub ping_timeout_secs: u64,
    pub max_failures: u32,
    pub provider_ttl_secs: u64,
    pub republish_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_providers_per_key: usize,
}

impl Default for DhtSection {
    fn default() -> Self {
        let defaults = DhtConfig::default();
        Self {
            k: defaults.k,
            alpha: defaults.alpha,
            query_timeout_secs: defaults.query_timeout.as_secs(),
            lookup_timeout_secs: defaults.lookup_timeout.as_secs(),
            ping_timeout_secs: defaults.ping_timeout.as_secs(),
            max_failures: defaults.max_failures,
            provider_ttl_secs: defaults.provider_ttl.as_secs(),
            republish_interval_secs: defaults.republish_interval.as_secs(),
            cleanup_interval_secs: defaults.cleanup_interval.as_secs(),
            max_providers_per_key: defaults.max_providers_per_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubSection {
    /// "all-peers" or "interested"
    pub flood_policy: String,
    pub seen_ttl_secs: u64,
    pub seen_capacity: usize,
    pub max_message_size: usize,
}

impl Default for PubSubSection {
    fn default() -> Self {
        let defaults = PubSubConfig::default();
        Self {
            flood_policy: defaults.flood_policy.to_string(),
            seen_ttl_secs: defaults.seen_ttl.as_secs(),
            seen_capacity: defaults.seen_capacity,
            max_message_size: defaults.max_message_size,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Load the file if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<Multiaddr> {
        self.node
            .listen
            .parse::<Multiaddr>()
            .map_err(|e| anyhow!("Invalid listen address {}: {}", self.node.listen, e))
    }

    pub fn external_addr(&self) -> Result<Option<Multiaddr>> {
        self.node
            .external_addr
            .as_deref()
            .map(|a| {
                a.parse::<Multiaddr>()
                    .map_err(|e| anyhow!("Invalid external address {}: {}", a, e))
            })
            .transpose()
    }

    pub fn bootstrap_addrs(&self) -> Result<Vec<Multiaddr>> {
        self.node
            .bootstrap
            .iter()
            .map(|a| {
                a.parse::<Multiaddr>()
                    .map_err(|e| anyhow!("Invalid bootstrap address {}: {}", a, e))
            })
            .collect()
    }

    /// Peer id derived from the identity seed, or a random one
    pub fn peer_id(&self) -> Result<PeerId> {
        match &self.node.identity {
            Some(seed) => Ok(PeerId::from_public_key(seed.as_bytes())),
            None => Ok(PeerId::random()?),
        }
    }

    pub fn dht_config(&self) -> DhtConfig {
        let dht = &self.dht;
        DhtConfig {
            k: dht.k,
            alpha: dht.alpha,
            query_timeout: Duration::from_secs(dht.query_timeout_secs),
            lookup_timeout: Duration::from_secs(dht.lookup_timeout_secs),
            ping_timeout: Duration::from_secs(dht.ping_timeout_secs),
            max_failures: dht.max_failures,
            provider_ttl: Duration::from_secs(dht.provider_ttl_secs),
            republish_interval: Duration::from_secs(dht.republish_interval_secs),
            cleanup_interval: Duration::from_secs(dht.cleanup_interval_secs),
            max_providers_per_key: dht.max_providers_per_key,
        }
    }

    pub fn pubsub_config(&self) -> Result<PubSubConfig> {
        let pubsub = &self.pubsub;
        let flood_policy: FloodPolicy = pubsub.flood_policy.parse().map_err(|e| anyhow!("{}", e))?;
        Ok(PubSubConfig {
            flood_policy,
            seen_ttl: Duration::from_secs(pubsub.seen_ttl_secs),
            seen_capacity: pubsub.seen_capacity,
            max_message_size: pubsub.max_message_size,
        })
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::default();
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[node]
listen = "/ip4/0.0.0.0/tcp/5000"
external_addr = "/ip4/203.0.113.7/tcp/5000"
bootstrap = ["/ip4/127.0.0.1/tcp/4001"]

[dht]
k = 8

[pubsub]
flood_policy = "interested"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.dht.k, 8);
        assert_eq!(config.dht.alpha, 3);
        assert_eq!(config.bootstrap_addrs().unwrap().len(), 1);
        assert_eq!(config.listen_addr().unwrap().to_string(), "/ip4/0.0.0.0/tcp/5000");
        assert_eq!(
            config.external_addr().unwrap().map(|a| a.to_string()),
            Some("/ip4/203.0.113.7/tcp/5000".to_string())
        );
        assert_eq!(Config::default().external_addr().unwrap(), None);

        let dht = config.dht_config();
        assert_eq!(dht.k, 8);
        assert_eq!(dht.provider_ttl, Duration::from_secs(24 * 60 * 60));
        let pubsub = config.pubsub_config().unwrap();
        assert_eq!(pubsub.flood_policy, FloodPolicy::Interested);
        assert_eq!(pubsub.seen_capacity, 10_000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.pubsub.flood_policy = "gossip".to_string();
        assert!(config.pubsub_config().is_err());

        config.node.bootstrap = vec!["not an address".to_string()];
        assert!(config.bootstrap_addrs().is_err());

        config.node.external_addr = Some("/dns4/example.com/tcp/1".to_string());
        assert!(config.external_addr().is_err());
    }

    #[test]
    fn test_identity_seed_is_stable() {
        let mut config = Config::default();
        config.node.identity = Some("alice".to_string());
        assert_eq!(config.peer_id().unwrap(), config.peer_id().unwrap());

        config.node.identity = None;
        assert_ne!(config.peer_id().unwrap(), config.peer_id().unwrap());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
