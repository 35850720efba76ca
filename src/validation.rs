//! Admission validation
//!
//! Checks run in a fixed order and stop at the first failure:
//! 1. schema (per message kind)
//! 2. signature over the domain-separated digest
//! 3. authorization against one registry snapshot
//! 4. freshness against the configured skew window
//!
//! Validation is pure: it reads the snapshot and the clock value handed in by
//! the caller and never touches the store.

use ed25519_dalek::Verifier;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ValidationError;
use crate::message::{Identity, Message, MessageBody, MessageKind, Signature};
use crate::registry::RegistrySnapshot;

pub const MAX_HREF_BYTES: usize = 2048;
pub const MAX_TITLE_CHARS: usize = 280;
pub const MAX_COMMENT_CHARS: usize = 2000;

/// Where a message entered this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Submitted through the admission API.
    Local,
    /// Delivered by a peer (catch-up or live announce).
    Peer,
}

/// Accepted skew between a message timestamp and the local clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessPolicy {
    /// How far in the past a locally submitted message may be dated.
    /// Not applied to peer deliveries, which legitimately carry history.
    #[serde(default)]
    pub max_past_secs: Option<u64>,

    /// How far in the future any message may be dated.
    #[serde(default)]
    pub max_future_secs: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    freshness: FreshnessPolicy,
}

impl Validator {
    pub fn new(freshness: FreshnessPolicy) -> Self {
        Self { freshness }
    }

    /// Validate `message`, returning the identity it is attributed to.
    ///
    /// `snapshot` is `None` when the registry has never been reachable, in
    /// which case every message is unauthorized.
    pub fn validate(
        &self,
        message: &Message,
        snapshot: Option<&RegistrySnapshot>,
        origin: Origin,
        now: u64,
    ) -> Result<Identity, ValidationError> {
        check_schema(message)?;
        verify_signature(message)?;

        let snapshot = snapshot.ok_or_else(|| {
            ValidationError::Unauthorized("registry snapshot unavailable".to_string())
        })?;
        if !snapshot.is_authorized(&message.identity) {
            return Err(ValidationError::Unauthorized(format!(
                "{} is not allowlisted or delegated",
                message.identity
            )));
        }

        self.check_freshness(message.timestamp, origin, now)?;

        Ok(snapshot.resolve(&message.identity))
    }

    fn check_freshness(&self, timestamp: u64, origin: Origin, now: u64) -> Result<(), ValidationError> {
        let stale = origin == Origin::Local
            && self
                .freshness
                .max_past_secs
                .is_some_and(|max| now.saturating_sub(timestamp) > max);
        let future = self
            .freshness
            .max_future_secs
            .is_some_and(|max| timestamp.saturating_sub(now) > max);

        if stale || future {
            Err(ValidationError::StaleOrFutureMessage { timestamp, now })
        } else {
            Ok(())
        }
    }
}

/// Structural checks on an already typed message.
pub fn check_schema(message: &Message) -> Result<(), ValidationError> {
    check_href(message.href())?;
    match &message.body {
        MessageBody::Submission { title, .. } => check_text("title", title, MAX_TITLE_CHARS),
        MessageBody::Comment { title, .. } => check_text("comment", title, MAX_COMMENT_CHARS),
        MessageBody::Upvote { .. } => Ok(()),
    }
}

fn check_href(href: &str) -> Result<(), ValidationError> {
    if href.len() > MAX_HREF_BYTES {
        return Err(ValidationError::SchemaInvalid(format!(
            "href longer than {} bytes",
            MAX_HREF_BYTES
        )));
    }
    let url = Url::parse(href)
        .map_err(|e| ValidationError::SchemaInvalid(format!("href is not a URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ValidationError::SchemaInvalid(
            "href must be an absolute http(s) URL".to_string(),
        ));
    }
    Ok(())
}

fn check_text(field: &str, text: &str, max_chars: usize) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::SchemaInvalid(format!("{} is empty", field)));
    }
    if text.chars().count() > max_chars {
        return Err(ValidationError::SchemaInvalid(format!(
            "{} longer than {} characters",
            field, max_chars
        )));
    }
    Ok(())
}

/// Verify the signature against the signer identity.
pub fn verify_signature(message: &Message) -> Result<(), ValidationError> {
    let key = message
        .identity
        .verifying_key()
        .map_err(|_| ValidationError::InvalidSignature)?;
    key.verify(&message.signing_digest(), &message.signature.to_dalek())
        .map_err(|_| ValidationError::InvalidSignature)
}

/// Loosely typed message as it arrives on the JSON admission boundary.
///
/// Every field is optional so that a missing field is reported as a schema
/// error with a useful message instead of a generic decode failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidateMessage {
    pub identity: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub href: Option<String>,
    pub title: Option<String>,
    pub timestamp: Option<serde_json::Value>,
    pub signature: Option<String>,
}

impl CandidateMessage {
    /// Build the typed message, reporting the first schema problem.
    pub fn into_message(self) -> Result<Message, ValidationError> {
        let identity: Identity = required(self.identity, "identity")?
            .parse()
            .map_err(|e| ValidationError::SchemaInvalid(format!("identity: {}", e)))?;
        let signature: Signature = required(self.signature, "signature")?
            .parse()
            .map_err(|e| ValidationError::SchemaInvalid(format!("signature: {}", e)))?;
        let timestamp = parse_timestamp(self.timestamp)?;

        let kind_name = required(self.kind, "type")?;
        let kind = MessageKind::parse(&kind_name)
            .ok_or_else(|| ValidationError::SchemaInvalid(format!("unknown type '{}'", kind_name)))?;
        let href = required(self.href, "href")?;

        let body = match kind {
            MessageKind::Submission => MessageBody::Submission {
                href,
                title: required(self.title, "title")?,
            },
            MessageKind::Comment => MessageBody::Comment {
                href,
                title: required(self.title, "title")?,
            },
            MessageKind::Upvote => {
                if self.title.is_some() {
                    return Err(ValidationError::SchemaInvalid(
                        "upvote must not carry a title".to_string(),
                    ));
                }
                MessageBody::Upvote { href }
            }
        };

        let message = Message {
            identity,
            body,
            timestamp,
            signature,
        };
        check_schema(&message)?;
        Ok(message)
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, ValidationError> {
    value.ok_or_else(|| ValidationError::SchemaInvalid(format!("missing field '{}'", field)))
}

fn parse_timestamp(value: Option<serde_json::Value>) -> Result<u64, ValidationError> {
    let invalid = || ValidationError::SchemaInvalid("timestamp must be unix seconds".to_string());
    match value {
        None => Err(ValidationError::SchemaInvalid("missing field 'timestamp'".to_string())),
        Some(serde_json::Value::Number(n)) => n.as_u64().ok_or_else(invalid),
        Some(serde_json::Value::String(s)) => s.trim().parse().map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}
