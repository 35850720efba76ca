//! Admission pipeline: Validator -> single writer
//!
//! Local submissions and peer deliveries share this path; only the origin
//! (which selects the freshness rules) and the recorded source differ.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::AdmissionError;
use crate::message::Message;
use crate::registry::SnapshotCache;
use crate::store::{AddOutcome, WriterHandle};
use crate::validation::{Origin, Validator};

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct Admission {
    validator: Validator,
    registry: Arc<SnapshotCache>,
    writer: WriterHandle,
}

impl Admission {
    pub fn new(validator: Validator, registry: Arc<SnapshotCache>, writer: WriterHandle) -> Self {
        Self {
            validator,
            registry,
            writer,
        }
    }

    /// Admit a message submitted to this node.
    pub async fn submit(&self, message: Message) -> Result<AddOutcome, AdmissionError> {
        self.admit(message, Origin::Local, None).await
    }

    /// Admit a message delivered by `peer`.
    pub async fn ingest(&self, message: Message, peer: &str) -> Result<AddOutcome, AdmissionError> {
        self.admit(message, Origin::Peer, Some(peer.to_string()))
            .await
    }

    async fn admit(
        &self,
        message: Message,
        origin: Origin,
        source: Option<String>,
    ) -> Result<AddOutcome, AdmissionError> {
        let snapshot = self.registry.current().await;
        let author = self
            .validator
            .validate(&message, snapshot.as_deref(), origin, unix_now())?;
        debug!(signer = %message.identity, %author, kind = message.kind().as_str(), "Message validated");
        Ok(self.writer.add(message, source).await?)
    }

    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    pub fn registry(&self) -> &Arc<SnapshotCache> {
        &self.registry
    }
}
