//! Sync wire protocol
//!
//! ```text
//! Node A                                   Node B
//!   ├──── Hello(version, root, count) ─────►│
//!   │◄─── Hello(version, root, count) ──────┤   equal roots: done
//!   ├──── Manifest(prefix = []) ───────────►│
//!   │◄─── Manifest(entries) ────────────────┤   leaves + subtree digests
//!   ├──── Manifest(prefix = [3]) ──────────►│   only differing subtrees
//!   │◄─── Manifest(entries) ────────────────┤
//!   ├──── Fetch(hashes) ───────────────────►│   missing leaves, batched
//!   │◄─── Messages(messages) ───────────────┤
//!   │                                       │
//!   ├──── Announce(message) ───────────────►│   live, once idle
//!   │◄─── Ack(accepted) ────────────────────┤
//! ```
//!
//! Every request carries the protocol version. A peer answering with
//! `Error(VersionMismatch)` is disconnected.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{ContentHash, Message, TrieDigest};
use crate::store::trie::ManifestEntry;

/// Wire protocol version; bump on any incompatible message change.
pub const PROTOCOL_VERSION: u32 = 1;

/// State summary exchanged at the start of every reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub root: TrieDigest,
    pub leaf_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub version: u32,
    pub body: RequestBody,
}

impl SyncRequest {
    pub fn new(body: RequestBody) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    Hello(Hello),
    /// Describe the trie under a nibble prefix.
    Manifest { prefix: Vec<u8> },
    /// Return the messages with these content hashes.
    Fetch { hashes: Vec<ContentHash> },
    /// Push a freshly inserted message.
    Announce { message: Message },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncResponse {
    Hello(Hello),
    Manifest {
        prefix: Vec<u8>,
        entries: Vec<ManifestEntry>,
    },
    /// Requested messages that were found; unknown hashes are omitted.
    Messages { messages: Vec<Message> },
    Ack { accepted: bool },
    Error(WireError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    VersionMismatch { supported: u32 },
    BadRequest(String),
}

/// A peer broke the protocol; the session is torn down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("Unexpected response: {0}")]
    Unexpected(String),

    #[error("Peer rejected request: {0}")]
    Rejected(String),

    #[error("Request failed: {0}")]
    Transport(String),
}
