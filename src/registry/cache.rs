//! Snapshot cache owned by the node wiring
//!
//! Holds the last successfully fetched snapshot. Admission reads whatever is
//! cached; a refresh failure keeps the previous snapshot (momentary staleness
//! is acceptable), and having no snapshot at all fails closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Registry, RegistryError, RegistrySnapshot};

pub struct SnapshotCache {
    registry: Arc<dyn Registry>,
    current: RwLock<Option<Arc<RegistrySnapshot>>>,
}

impl SnapshotCache {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            current: RwLock::new(None),
        }
    }

    /// Cache pre-seeded with a snapshot, for tests and static setups.
    pub fn with_snapshot(registry: Arc<dyn Registry>, snapshot: RegistrySnapshot) -> Self {
        Self {
            registry,
            current: RwLock::new(Some(Arc::new(snapshot))),
        }
    }

    /// The cached snapshot, if any refresh has ever succeeded.
    pub async fn current(&self) -> Option<Arc<RegistrySnapshot>> {
        self.current.read().await.clone()
    }

    /// Fetch a fresh snapshot and swap it in.
    pub async fn refresh(&self) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        let snapshot = Arc::new(self.registry.snapshot().await?);
        debug!(
            allowlist = snapshot.allowlist.len(),
            delegations = snapshot.delegations.len(),
            "Registry snapshot refreshed"
        );
        *self.current.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Refresh on a fixed interval until the returned handle is aborted.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "Registry refresh task started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    warn!(error = %e, "Registry refresh failed, keeping previous snapshot");
                }
            }
        })
    }
}
