//! Gateway configuration

use anyhow::Context;
use ipnetwork::Ipv4Network;
use meshgate_common::address::{DEFAULT_NETWORK, DEFAULT_SEED};
use meshgate_common::authority::SiteTemplate;
use meshgate_common::broker::DEFAULT_CHANNEL_CAPACITY;
use meshgate_common::relay::DEFAULT_PROBE_INTERVAL;
use meshgate_common::{AddressAllocator, Broker, MemoryBroker, RedisBroker};
use meshgate_web::auth::{DEFAULT_ACCESS_TTL, DEFAULT_REFRESH_TTL};
use meshgate_web::OAuthConfig;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const AUTH_SECRET_ENV: &str = "MESHGATE_AUTH_SECRET";
pub const OAUTH_CLIENT_SECRET_ENV: &str = "MESHGATE_OAUTH_CLIENT_SECRET";
pub const REDIS_URL_ENV: &str = "MESHGATE_REDIS_URL";

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP listen address
    pub http_listen: String,

    /// gRPC listen address
    pub grpc_listen: String,

    /// Store directory path
    pub store_path: PathBuf,

    pub auth: AuthConfig,

    /// Identity provider; login redirects answer 503 without it
    pub oauth: Option<OAuthConfig>,

    pub pki: PkiConfig,

    pub overlay: OverlayConfig,

    pub relay: RelayConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_listen: "127.0.0.1:8080".to_string(),
            grpc_listen: "127.0.0.1:50051".to_string(),
            store_path: meshgate_common::default_store_path(),
            auth: AuthConfig::default(),
            oauth: None,
            pki: PkiConfig::default(),
            overlay: OverlayConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// Token signing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret. A random one is generated at startup when unset.
    pub secret: Option<String>,

    /// Access token lifetime in seconds
    pub access_ttl_secs: u64,

    /// Refresh token lifetime in seconds
    pub refresh_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            access_ttl_secs: DEFAULT_ACCESS_TTL.as_secs(),
            refresh_ttl_secs: DEFAULT_REFRESH_TTL.as_secs(),
        }
    }
}

/// Signing tool and root material
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiConfig {
    /// Path to the `nebula-cert` binary
    pub tool: PathBuf,

    /// Directory holding `ca.crt` and `ca.key`. Defaults to `<store>/pki`.
    pub dir: Option<PathBuf>,

    pub ca_name: String,

    /// Suffix of issued certificate names
    pub cert_domain: String,

    pub timeout_secs: u64,

    /// Issued certificate lifetime; the tool's default when unset
    pub cert_duration_secs: Option<u64>,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            tool: PathBuf::from("nebula-cert"),
            dir: None,
            ca_name: "Meshgate Root CA".to_string(),
            cert_domain: meshgate_common::authority::DEFAULT_CERT_DOMAIN.to_string(),
            timeout_secs: 30,
            cert_duration_secs: None,
        }
    }
}

/// Overlay address space and the descriptor handed to devices
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub network: String,

    /// First address leased in an empty network
    pub seed: Ipv4Addr,

    #[serde(flatten)]
    pub site: SiteTemplate,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            seed: DEFAULT_SEED,
            site: SiteTemplate::default(),
        }
    }
}

impl OverlayConfig {
    pub fn allocator(&self) -> anyhow::Result<AddressAllocator> {
        let network: Ipv4Network = self
            .network
            .parse()
            .with_context(|| format!("invalid overlay network {}", self.network))?;
        Ok(AddressAllocator::new(network, self.seed)?)
    }
}

/// Where signaling channels live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process; only devices connected to this node can reach each other
    #[default]
    Memory,
    /// Shared through a Redis server
    Redis,
}

/// Signaling relay tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub backend: BrokerBackend,

    /// Required with the redis backend, e.g. `redis://127.0.0.1:6379`
    pub redis_url: Option<String>,

    /// Liveness probe and SSE keep-alive interval in seconds
    pub probe_interval_secs: u64,

    /// Per-channel buffer before slow subscribers start lagging
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Memory,
            redis_url: None,
            probe_interval_secs: DEFAULT_PROBE_INTERVAL.as_secs(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl RelayConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    /// Build the configured broker
    pub async fn broker(&self) -> anyhow::Result<Arc<dyn Broker>> {
        match self.backend {
            BrokerBackend::Memory => Ok(Arc::new(MemoryBroker::new(self.channel_capacity))),
            BrokerBackend::Redis => {
                let url = self
                    .redis_url
                    .as_deref()
                    .filter(|url| !url.is_empty())
                    .context("relay.redis_url is required for the redis backend")?;
                let broker = RedisBroker::connect(url, self.channel_capacity)
                    .await
                    .with_context(|| format!("failed to connect to {}", url))?;
                Ok(Arc::new(broker))
            }
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: Self = toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply secrets from the environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(AUTH_SECRET_ENV).filter(|s| !s.is_empty()) {
            self.auth.secret = Some(secret);
        }
        if let Some(secret) = lookup(OAUTH_CLIENT_SECRET_ENV).filter(|s| !s.is_empty()) {
            if let Some(oauth) = self.oauth.as_mut() {
                oauth.client_secret = secret;
            }
        }
        if let Some(url) = lookup(REDIS_URL_ENV).filter(|s| !s.is_empty()) {
            self.relay.redis_url = Some(url);
        }
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Get the PKI directory
    pub fn pki_dir(&self) -> PathBuf {
        self.pki
            .dir
            .clone()
            .unwrap_or_else(|| self.store_path.join("pki"))
    }

    pub fn signing_timeout(&self) -> Duration {
        Duration::from_secs(self.pki.timeout_secs.max(1))
    }

    pub fn cert_duration(&self) -> Option<Duration> {
        self.pki.cert_duration_secs.map(Duration::from_secs)
    }

    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.access_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.refresh_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.grpc_listen, "127.0.0.1:50051");
        assert_eq!(config.relay.probe_interval(), Duration::from_secs(15));
        assert_eq!(config.access_ttl(), Duration::from_secs(72 * 3600));
        assert!(config.auth.secret.is_none());
        assert!(config.oauth.is_none());
        assert_eq!(config.relay.backend, BrokerBackend::Memory);

        let allocator = config.overlay.allocator().unwrap();
        assert_eq!(allocator.seed(), Ipv4Addr::new(69, 69, 0, 2));
    }

    #[tokio::test]
    async fn test_broker_backend_selection() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [relay]
            backend = "redis"
            "#,
        )
        .unwrap();
        assert_eq!(config.relay.backend, BrokerBackend::Redis);
        assert!(config.relay.broker().await.is_err());

        let mut config = config;
        config.apply_overrides(|key| (key == REDIS_URL_ENV).then(|| "redis://h:6379".to_string()));
        assert_eq!(config.relay.redis_url.as_deref(), Some("redis://h:6379"));

        let memory = RelayConfig::default().broker().await.unwrap();
        let mut sub = memory.subscribe("dev").await.unwrap();
        assert_eq!(memory.publish("dev", "x".into()).await.unwrap(), 1);
        assert_eq!(sub.recv().await.unwrap().payload, "x");

        assert!(toml::from_str::<RelayConfig>("backend = \"kafka\"").is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            http_listen = "0.0.0.0:9000"

            [overlay]
            network = "10.10.0.0/24"
            seed = "10.10.0.5"
            mtu = 1400

            [overlay.lighthouses]
            "10.10.0.1" = ["lh.example.com:4242"]

            [pki]
            dir = "/etc/meshgate/pki"
            "#,
        )
        .unwrap();

        assert_eq!(config.http_listen, "0.0.0.0:9000");
        assert_eq!(config.grpc_listen, "127.0.0.1:50051");
        assert_eq!(config.overlay.site.mtu, 1400);
        assert_eq!(config.overlay.site.cipher, "aes");
        assert_eq!(
            config.overlay.site.lighthouses["10.10.0.1"],
            vec!["lh.example.com:4242".to_string()]
        );
        assert_eq!(config.pki_dir(), PathBuf::from("/etc/meshgate/pki"));
        assert_eq!(config.pki.tool, PathBuf::from("nebula-cert"));

        let allocator = config.overlay.allocator().unwrap();
        assert_eq!(allocator.network_key(), "10.10.0.0/24");
    }

    #[test]
    fn test_invalid_overlay_rejected() {
        let mut overlay = OverlayConfig::default();
        overlay.network = "not-a-cidr".to_string();
        assert!(overlay.allocator().is_err());

        let overlay = OverlayConfig {
            network: "10.0.0.0/24".to_string(),
            ..OverlayConfig::default()
        };
        // default seed lies outside 10.0.0.0/24
        assert!(overlay.allocator().is_err());
    }

    #[test]
    fn test_env_overrides_secrets() {
        let env: HashMap<&str, &str> = [
            (AUTH_SECRET_ENV, "from-env"),
            (OAUTH_CLIENT_SECRET_ENV, "client-secret"),
        ]
        .into_iter()
        .collect();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let mut config = GatewayConfig::default();
        config.apply_overrides(lookup);
        assert_eq!(config.auth.secret.as_deref(), Some("from-env"));
        assert!(config.oauth.is_none());

        config.oauth = Some(OAuthConfig::default());
        config.apply_overrides(lookup);
        assert_eq!(
            config.oauth.as_ref().map(|o| o.client_secret.as_str()),
            Some("client-secret")
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = GatewayConfig::default();
        config.store_path = dir.path().to_path_buf();
        config.relay.channel_capacity = 8;
        config.save(&path).unwrap();

        let loaded = GatewayConfig::load(&path).unwrap();
        assert_eq!(loaded.relay.channel_capacity, 8);
        assert_eq!(loaded.db_path(), dir.path().join("state.db"));
        assert_eq!(loaded.pki_dir(), dir.path().join("pki"));

        let missing = GatewayConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.http_listen, "127.0.0.1:8080");
    }
}
