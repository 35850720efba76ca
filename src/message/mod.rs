//! Signed message envelope - the unit of replication
//!
//! A [`Message`] binds a signer identity, a typed body and a timestamp under
//! one Ed25519 signature. The signed bytes are domain separated so a
//! signature produced for this log cannot be replayed in another context.
//!
//! ```text
//! signing digest = SHA-256( "kiwi-node:message:v1" 0x00
//!                           identity[32] kind[1] timestamp[u64 BE]
//!                           href-len[u32 BE] href
//!                           title-flag[1] (title-len[u32 BE] title)? )
//! content hash   = SHA-256( "kiwi-node:leaf:v1" 0x00 signing-digest signature[64] )
//! ```

pub mod canonical;
pub mod identity;

use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use canonical::canonical_href;
pub use identity::{ContentHash, HexError, Identity, Signature, TrieDigest};

/// Signing domain; bump the suffix on any change to the payload layout.
pub const SIGNING_DOMAIN: &[u8] = b"kiwi-node:message:v1";

/// Domain for content hashes of stored leaves.
pub const LEAF_DOMAIN: &[u8] = b"kiwi-node:leaf:v1";

/// Discriminant of a message body, used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Submission,
    Upvote,
    Comment,
}

impl MessageKind {
    fn tag(self) -> u8 {
        match self {
            MessageKind::Submission => 1,
            MessageKind::Upvote => 2,
            MessageKind::Comment => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Submission => "submission",
            MessageKind::Upvote => "upvote",
            MessageKind::Comment => "comment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submission" => Some(MessageKind::Submission),
            "upvote" => Some(MessageKind::Upvote),
            "comment" => Some(MessageKind::Comment),
            _ => None,
        }
    }
}

/// Typed message body. Each variant carries exactly the fields its kind allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    /// A new link with its display title.
    Submission { href: String, title: String },
    /// Engagement with an already shared link.
    Upvote { href: String },
    /// Text attached to a link; `title` holds the comment text.
    Comment { href: String, title: String },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Submission { .. } => MessageKind::Submission,
            MessageBody::Upvote { .. } => MessageKind::Upvote,
            MessageBody::Comment { .. } => MessageKind::Comment,
        }
    }

    pub fn href(&self) -> &str {
        match self {
            MessageBody::Submission { href, .. }
            | MessageBody::Upvote { href }
            | MessageBody::Comment { href, .. } => href,
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            MessageBody::Submission { title, .. } | MessageBody::Comment { title, .. } => {
                Some(title)
            }
            MessageBody::Upvote { .. } => None,
        }
    }
}

/// An immutable signed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub identity: Identity,
    #[serde(flatten)]
    pub body: MessageBody,
    pub timestamp: u64,
    pub signature: Signature,
}

impl Message {
    /// Sign `body` at `timestamp` with `key`.
    pub fn sign(key: &SigningKey, body: MessageBody, timestamp: u64) -> Self {
        let identity = Identity::from_signing_key(key);
        let digest = signing_digest(&identity, &body, timestamp);
        let signature = key.sign(&digest).into();
        Self {
            identity,
            body,
            timestamp,
            signature,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn href(&self) -> &str {
        self.body.href()
    }

    pub fn title(&self) -> Option<&str> {
        self.body.title()
    }

    /// Deduplication key of the referenced resource.
    pub fn canonical_href(&self) -> String {
        canonical_href(self.href())
    }

    /// Digest the signature is computed over.
    pub fn signing_digest(&self) -> [u8; 32] {
        signing_digest(&self.identity, &self.body, self.timestamp)
    }

    /// Content address of this message. Pure function of all fields.
    pub fn content_hash(&self) -> ContentHash {
        let mut hasher = Sha256::new();
        hasher.update(LEAF_DOMAIN);
        hasher.update([0u8]);
        hasher.update(self.signing_digest());
        hasher.update(self.signature.as_bytes());
        ContentHash::from_bytes(hasher.finalize().into())
    }
}

fn signing_digest(identity: &Identity, body: &MessageBody, timestamp: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SIGNING_DOMAIN);
    hasher.update([0u8]);
    hasher.update(identity.as_bytes());
    hasher.update([body.kind().tag()]);
    hasher.update(timestamp.to_be_bytes());

    let href = body.href().as_bytes();
    hasher.update((href.len() as u32).to_be_bytes());
    hasher.update(href);

    match body.title() {
        Some(title) => {
            let title = title.as_bytes();
            hasher.update([1u8]);
            hasher.update((title.len() as u32).to_be_bytes());
            hasher.update(title);
        }
        None => hasher.update([0u8]),
    }

    hasher.finalize().into()
}
