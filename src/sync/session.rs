//! Per-peer reconciliation state
//!
//! ```text
//! Disconnected ──connect──► Handshaking ──roots equal──► Idle (streaming)
//!                               │                          ▲     │
//!                               └──roots differ──► Synchronizing  │
//!                                                          anti-entropy tick
//! ```
//!
//! A session is transport agnostic: it turns responses into follow-up
//! requests plus messages to deliver, and leaves sending and ingestion to
//! the driver (the coordinator, or a test harness).

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use super::protocol::{
    Hello, ProtocolError, RequestBody, SyncRequest, SyncResponse, WireError, PROTOCOL_VERSION,
};
use super::SyncLimits;
use crate::message::{ContentHash, Message};
use crate::store::trie::ManifestEntry;
use crate::store::LeafStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Disconnected,
    Handshaking,
    Synchronizing,
    /// In sync; live announces flow to this peer.
    Idle,
}

/// Output of one step of the session.
#[derive(Debug, Default)]
pub struct SessionStep {
    pub requests: Vec<SyncRequest>,
    /// Fetched messages for the driver to ingest.
    pub deliver: Vec<Message>,
}

/// Exponential redial delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; each call doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub struct PeerSession {
    peer: String,
    state: PeerState,
    limits: SyncLimits,
    in_flight: usize,
    missing: VecDeque<ContentHash>,
    requested: HashSet<ContentHash>,
    invalid_messages: u64,
    fetched: u64,
    backoff: Backoff,
}

impl PeerSession {
    pub fn new(peer: impl Into<String>, limits: SyncLimits, backoff: Backoff) -> Self {
        Self {
            peer: peer.into(),
            state: PeerState::Disconnected,
            limits,
            in_flight: 0,
            missing: VecDeque::new(),
            requested: HashSet::new(),
            invalid_messages: 0,
            fetched: 0,
            backoff,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn invalid_messages(&self) -> u64 {
        self.invalid_messages
    }

    /// Whether live announces should be pushed to this peer.
    pub fn is_streaming(&self) -> bool {
        self.state == PeerState::Idle
    }

    /// Begin (or restart) reconciliation with `local` as our summary.
    ///
    /// Returns `None` while a reconciliation is already running.
    pub fn start(&mut self, local: Hello) -> Option<SyncRequest> {
        if matches!(self.state, PeerState::Handshaking | PeerState::Synchronizing) {
            return None;
        }
        self.state = PeerState::Handshaking;
        self.in_flight = 1;
        self.missing.clear();
        self.requested.clear();
        Some(SyncRequest::new(RequestBody::Hello(local)))
    }

    /// Count a message from this peer that failed validation.
    pub fn record_invalid(&mut self) {
        self.invalid_messages += 1;
        debug!(peer = %self.peer, total = self.invalid_messages, "Invalid message from peer");
    }

    /// Tear down the session; returns how long to wait before redialing.
    pub fn disconnect(&mut self) -> Duration {
        self.state = PeerState::Disconnected;
        self.in_flight = 0;
        self.missing.clear();
        self.requested.clear();
        self.backoff.next_delay()
    }

    /// Handle a response to one of our reconciliation requests.
    pub fn on_response(
        &mut self,
        response: SyncResponse,
        store: &LeafStore,
    ) -> Result<SessionStep, ProtocolError> {
        let mut step = SessionStep::default();

        match response {
            // Announce acknowledgements are not part of reconciliation.
            SyncResponse::Ack { .. } => return Ok(step),

            SyncResponse::Error(WireError::VersionMismatch { supported }) => {
                return Err(ProtocolError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: supported,
                });
            }
            SyncResponse::Error(WireError::BadRequest(reason)) => {
                return Err(ProtocolError::Rejected(reason));
            }

            SyncResponse::Hello(remote) => {
                self.expect_state(PeerState::Handshaking, "hello")?;
                if remote.version != PROTOCOL_VERSION {
                    return Err(ProtocolError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: remote.version,
                    });
                }
                self.in_flight -= 1;
                if remote.root == store.root() {
                    self.finish();
                } else {
                    debug!(
                        peer = %self.peer,
                        local = store.len(),
                        remote = remote.leaf_count,
                        "Roots differ, reconciling"
                    );
                    self.state = PeerState::Synchronizing;
                    step.requests.push(self.issue(RequestBody::Manifest { prefix: Vec::new() }));
                }
            }

            SyncResponse::Manifest { entries, .. } => {
                self.expect_state(PeerState::Synchronizing, "manifest")?;
                self.in_flight -= 1;
                for entry in entries {
                    match entry {
                        ManifestEntry::Leaf(hash) => {
                            if !store.has(&hash) && self.requested.insert(hash) {
                                self.missing.push_back(hash);
                            }
                        }
                        ManifestEntry::Subtree { prefix, digest, .. } => {
                            if store.digest_at(&prefix) != Some(digest) {
                                step.requests.push(self.issue(RequestBody::Manifest { prefix }));
                            }
                        }
                    }
                }
            }

            SyncResponse::Messages { messages } => {
                self.expect_state(PeerState::Synchronizing, "messages")?;
                self.in_flight -= 1;
                for message in messages {
                    if self.requested.remove(&message.content_hash()) {
                        self.fetched += 1;
                        step.deliver.push(message);
                    } else {
                        self.record_invalid();
                    }
                }
            }
        }

        self.drain_missing(&mut step);
        if self.state == PeerState::Synchronizing && self.in_flight == 0 {
            self.finish();
        }
        Ok(step)
    }

    fn expect_state(&self, state: PeerState, what: &str) -> Result<(), ProtocolError> {
        if self.state == state && self.in_flight > 0 {
            Ok(())
        } else {
            Err(ProtocolError::Unexpected(format!(
                "{} while {:?}",
                what, self.state
            )))
        }
    }

    fn issue(&mut self, body: RequestBody) -> SyncRequest {
        self.in_flight += 1;
        SyncRequest::new(body)
    }

    fn drain_missing(&mut self, step: &mut SessionStep) {
        let batch = self.limits.fetch_batch.max(1);
        while !self.missing.is_empty() {
            let take = batch.min(self.missing.len());
            let hashes: Vec<ContentHash> = self.missing.drain(..take).collect();
            step.requests.push(self.issue(RequestBody::Fetch { hashes }));
        }
    }

    fn finish(&mut self) {
        if self.state == PeerState::Synchronizing {
            info!(peer = %self.peer, fetched = self.fetched, "Reconciled with peer");
        }
        self.state = PeerState::Idle;
        self.requested.clear();
        self.fetched = 0;
        self.backoff.reset();
    }
}
