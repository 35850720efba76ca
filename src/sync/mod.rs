//! Sync engine - anti-entropy replication of the leaf set
//!
//! Handles:
//! - Root comparison and trie-prefix reconciliation with each peer
//! - Batched fetch of missing leaves through the admission path
//! - Live announce of every newly inserted leaf
//! - Periodic re-handshake to repair missed announces

pub mod coordinator;
pub mod protocol;
pub mod service;
pub mod session;

use serde::{Deserialize, Serialize};

pub use coordinator::{PeerStatus, SyncCoordinator, SyncStatus};
pub use protocol::{Hello, ProtocolError, RequestBody, SyncRequest, SyncResponse, PROTOCOL_VERSION};
pub use service::{IngestResult, SyncService};
pub use session::{Backoff, PeerSession, PeerState, SessionStep};

/// Sizes bounding one reconciliation exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLimits {
    /// Subtrees with at most this many leaves are listed leaf by leaf.
    pub manifest_leaf_limit: u64,
    /// Hashes per outbound fetch request.
    pub fetch_batch: usize,
    /// Largest fetch request we answer.
    pub max_fetch: usize,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            manifest_leaf_limit: 64,
            fetch_batch: 128,
            max_fetch: 512,
        }
    }
}
