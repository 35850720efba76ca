//! Responder side of the sync protocol
//!
//! Answers peer requests from the local store and routes announced messages
//! through the same admission path as local submissions.

use std::sync::Arc;

use tracing::{debug, warn};

use super::protocol::{Hello, RequestBody, SyncRequest, SyncResponse, WireError, PROTOCOL_VERSION};
use super::SyncLimits;
use crate::admission::Admission;
use crate::error::AdmissionError;
use crate::message::Message;
use crate::store::trie::valid_prefix;
use crate::store::{AddOutcome, LeafStore};

#[derive(Clone)]
pub struct SyncService {
    store: Arc<LeafStore>,
    admission: Admission,
    limits: SyncLimits,
}

/// What happened to one message delivered by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestResult {
    Inserted,
    AlreadyPresent,
    Invalid,
    Failed,
}

impl SyncService {
    pub fn new(admission: Admission, limits: SyncLimits) -> Self {
        let store = admission.writer().store().clone();
        Self {
            store,
            admission,
            limits,
        }
    }

    pub fn store(&self) -> &Arc<LeafStore> {
        &self.store
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn limits(&self) -> &SyncLimits {
        &self.limits
    }

    /// Local state summary.
    pub fn hello(&self) -> Hello {
        Hello {
            version: PROTOCOL_VERSION,
            root: self.store.root(),
            leaf_count: self.store.len(),
        }
    }

    /// Answer one request from `peer`.
    pub async fn handle(&self, peer: &str, request: SyncRequest) -> SyncResponse {
        if request.version != PROTOCOL_VERSION {
            warn!(peer, remote = request.version, "Protocol version mismatch");
            return SyncResponse::Error(WireError::VersionMismatch {
                supported: PROTOCOL_VERSION,
            });
        }

        match request.body {
            RequestBody::Hello(_) => SyncResponse::Hello(self.hello()),

            RequestBody::Manifest { prefix } => {
                if !valid_prefix(&prefix) {
                    return SyncResponse::Error(WireError::BadRequest(
                        "invalid trie prefix".to_string(),
                    ));
                }
                let entries = self.store.manifest(&prefix, self.limits.manifest_leaf_limit);
                debug!(peer, depth = prefix.len(), entries = entries.len(), "Serving manifest");
                SyncResponse::Manifest { prefix, entries }
            }

            RequestBody::Fetch { hashes } => {
                if hashes.len() > self.limits.max_fetch {
                    return SyncResponse::Error(WireError::BadRequest(format!(
                        "at most {} hashes per fetch",
                        self.limits.max_fetch
                    )));
                }
                let messages: Vec<_> = hashes
                    .iter()
                    .filter_map(|hash| self.store.get(hash))
                    .map(|leaf| leaf.message)
                    .collect();
                debug!(peer, requested = hashes.len(), found = messages.len(), "Serving fetch");
                SyncResponse::Messages { messages }
            }

            RequestBody::Announce { message } => {
                let accepted = self.ingest(peer, message).await;
                SyncResponse::Ack {
                    accepted: matches!(
                        accepted,
                        IngestResult::Inserted | IngestResult::AlreadyPresent
                    ),
                }
            }
        }
    }

    /// Admit a message pushed or fetched from `peer`.
    pub async fn ingest(&self, peer: &str, message: Message) -> IngestResult {
        let hash = message.content_hash();
        match self.admission.ingest(message, peer).await {
            Ok(AddOutcome::Inserted(_)) => IngestResult::Inserted,
            Ok(AddOutcome::AlreadyPresent(_)) => IngestResult::AlreadyPresent,
            Err(AdmissionError::Rejected(e)) => {
                debug!(peer, %hash, reason = e.code(), "Rejected message from peer");
                IngestResult::Invalid
            }
            Err(AdmissionError::Store(e)) => {
                warn!(peer, %hash, error = %e, "Failed to store message from peer");
                IngestResult::Failed
            }
        }
    }
}
