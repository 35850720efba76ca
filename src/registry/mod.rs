//! Registry adapter - allowlist and delegation snapshots
//!
//! Chain state is owned by an external oracle. The node only ever sees it as
//! a [`RegistrySnapshot`]: the allowlist and the delegation map fetched
//! together, so a single validation never mixes two refreshes.
//!
//! Sources:
//! - [`StaticRegistry`] - fixed snapshot (tests, single-operator setups)
//! - [`FileRegistry`] - JSON file maintained by an external indexer
//! - [`HttpRegistry`] - JSON endpoint of an oracle service

pub mod cache;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::Identity;

pub use cache::SnapshotCache;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Oracle request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Allowlist plus delegation map from one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Identities currently permitted to write.
    #[serde(default)]
    pub allowlist: BTreeSet<Identity>,

    /// Operational key -> owner it signs for.
    #[serde(default)]
    pub delegations: BTreeMap<Identity, Identity>,
}

impl RegistrySnapshot {
    pub fn new(
        allowlist: impl IntoIterator<Item = Identity>,
        delegations: impl IntoIterator<Item = (Identity, Identity)>,
    ) -> Self {
        Self {
            allowlist: allowlist.into_iter().collect(),
            delegations: delegations.into_iter().collect(),
        }
    }

    /// Identity a message from `signer` is attributed to.
    pub fn resolve(&self, signer: &Identity) -> Identity {
        self.delegations.get(signer).copied().unwrap_or(*signer)
    }

    /// Whether `signer`, after delegation resolution, is allowlisted.
    pub fn is_authorized(&self, signer: &Identity) -> bool {
        self.allowlist.contains(&self.resolve(signer))
    }
}

/// Source of registry snapshots.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn snapshot(&self) -> Result<RegistrySnapshot, RegistryError>;
}

/// Always returns the same snapshot.
pub struct StaticRegistry {
    snapshot: RegistrySnapshot,
}

impl StaticRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn snapshot(&self) -> Result<RegistrySnapshot, RegistryError> {
        Ok(self.snapshot.clone())
    }
}

/// Reads a snapshot from a JSON file on every refresh.
///
/// ```json
/// { "allowlist": ["<hex>", ...], "delegations": { "<delegate hex>": "<owner hex>" } }
/// ```
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn snapshot(&self) -> Result<RegistrySnapshot, RegistryError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Fetches the snapshot from an oracle endpoint serving the file format above.
pub struct HttpRegistry {
    client: reqwest::Client,
    url: String,
}

impl HttpRegistry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn snapshot(&self) -> Result<RegistrySnapshot, RegistryError> {
        let snapshot = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<RegistrySnapshot>()
            .await?;
        Ok(snapshot)
    }
}
