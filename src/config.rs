//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::query::DEFAULT_MAX_PAGE_SIZE;
use crate::sync::SyncLimits;
use crate::validation::FreshnessPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub p2p: P2PConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
}

impl Config {
    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human readable node name, used in logs and status
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Data directory (leaves.db, node_key)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between anti-entropy handshakes with idle peers
    #[serde(default = "default_anti_entropy_interval")]
    pub anti_entropy_interval_ms: u64,

    /// Pending insertions before producers wait
    #[serde(default = "default_ingest_queue_capacity")]
    pub ingest_queue_capacity: usize,

    /// First redial delay after a lost peer
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Longest redial delay
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    /// Subtrees at or below this size are listed leaf by leaf
    #[serde(default = "default_manifest_leaf_limit")]
    pub manifest_leaf_limit: u64,

    /// Hashes per outbound fetch
    #[serde(default = "default_fetch_batch")]
    pub fetch_batch: usize,

    /// Largest fetch answered
    #[serde(default = "default_max_fetch")]
    pub max_fetch: usize,
}

impl SyncConfig {
    /// Anti-entropy period; zero is treated as one millisecond.
    pub fn anti_entropy_interval(&self) -> Duration {
        Duration::from_millis(self.anti_entropy_interval_ms.max(1))
    }

    pub fn limits(&self) -> SyncLimits {
        SyncLimits {
            manifest_leaf_limit: self.manifest_leaf_limit,
            fetch_batch: self.fetch_batch,
            max_fetch: self.max_fetch,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            anti_entropy_interval_ms: default_anti_entropy_interval(),
            ingest_queue_capacity: default_ingest_queue_capacity(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            manifest_leaf_limit: default_manifest_leaf_limit(),
            fetch_batch: default_fetch_batch(),
            max_fetch: default_max_fetch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2PConfig {
    /// Listen addresses
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,

    /// Bootstrap nodes (`/ip4/.../tcp/.../p2p/<peer id>`)
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,

    /// Enable mDNS discovery
    #[serde(default = "default_true")]
    pub enable_mdns: bool,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            bootstrap_nodes: vec![],
            enable_mdns: true,
            request_timeout_secs: default_request_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Accepted timestamp skew
    #[serde(default = "default_freshness")]
    pub freshness: FreshnessPolicy,

    /// Largest page returned by list/posts; larger requests are clamped
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            freshness: default_freshness(),
            max_page_size: default_max_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// JSON snapshot file maintained by an indexer
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Oracle endpoint serving the same JSON; takes precedence over `file`
    #[serde(default)]
    pub url: Option<String>,

    /// Refresh interval in seconds
    #[serde(default = "default_registry_refresh")]
    pub refresh_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            file: None,
            url: None,
            refresh_secs: default_registry_refresh(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// JSON file with `flaggedUrls` / `flaggedIdentities`
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Defaults
fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "kiwi-node".to_string())
}
fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/kiwi-node") }
fn default_anti_entropy_interval() -> u64 { 30_000 }
fn default_ingest_queue_capacity() -> usize { 1024 }
fn default_backoff_base() -> u64 { 1_000 }
fn default_backoff_cap() -> u64 { 5 * 60 * 1_000 }
fn default_manifest_leaf_limit() -> u64 { SyncLimits::default().manifest_leaf_limit }
fn default_fetch_batch() -> usize { SyncLimits::default().fetch_batch }
fn default_max_fetch() -> usize { SyncLimits::default().max_fetch }
fn default_true() -> bool { true }
fn default_listen_addrs() -> Vec<String> {
    vec![
        "/ip4/0.0.0.0/tcp/4021".to_string(),
        "/ip4/0.0.0.0/udp/4021/quic-v1".to_string(),
    ]
}
fn default_request_timeout() -> u64 { 30 }
fn default_idle_timeout() -> u64 { 120 }
fn default_http_port() -> u16 { 8000 }
fn default_bind() -> String { "0.0.0.0".to_string() }
fn default_freshness() -> FreshnessPolicy {
    FreshnessPolicy {
        max_past_secs: Some(10 * 60),
        max_future_secs: Some(10 * 60),
    }
}
fn default_max_page_size() -> usize { DEFAULT_MAX_PAGE_SIZE }
fn default_registry_refresh() -> u64 { 60 }
