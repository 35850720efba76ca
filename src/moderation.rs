//! Read-time moderation
//!
//! Flagged resources and identities stay in the log; they are only hidden
//! from the posts and engagement views. `ModerationCache` rereads the lists
//! file on an interval so edits apply without a restart.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{canonical_href, Identity, Message};
use crate::registry::RegistryError;

/// Moderation lists as stored on disk.
///
/// ```json
/// { "flaggedUrls": ["https://example.com/spam"], "flaggedIdentities": ["<hex>"] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationLists {
    #[serde(default)]
    pub flagged_urls: BTreeSet<String>,
    #[serde(default)]
    pub flagged_identities: BTreeSet<Identity>,
}

impl ModerationLists {
    pub fn new(
        urls: impl IntoIterator<Item = impl AsRef<str>>,
        identities: impl IntoIterator<Item = Identity>,
    ) -> Self {
        Self {
            flagged_urls: urls.into_iter().map(|u| u.as_ref().to_string()).collect(),
            flagged_identities: identities.into_iter().collect(),
        }
        .canonicalized()
    }

    /// Load lists from a JSON file.
    pub async fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = tokio::fs::read_to_string(path).await?;
        let lists: ModerationLists = serde_json::from_str(&content)?;
        Ok(lists.canonicalized())
    }

    fn canonicalized(mut self) -> Self {
        self.flagged_urls = self
            .flagged_urls
            .iter()
            .map(|u| canonical_href(u))
            .collect();
        self
    }

    /// Whether `message` must be hidden. `author` is the attributed identity.
    pub fn is_flagged(&self, message: &Message, author: &Identity) -> bool {
        self.flagged_identities.contains(&message.identity)
            || self.flagged_identities.contains(author)
            || self.flagged_urls.contains(&message.canonical_href())
    }
}

/// Current moderation lists, optionally backed by a file.
pub struct ModerationCache {
    path: Option<PathBuf>,
    current: RwLock<Arc<ModerationLists>>,
}

impl ModerationCache {
    /// Lists that never change.
    pub fn fixed(lists: ModerationLists) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(lists)),
        }
    }

    /// Load `path` now and reread it on every refresh.
    pub async fn open(path: PathBuf) -> Result<Self, RegistryError> {
        let lists = ModerationLists::load(&path).await?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(lists)),
        })
    }

    pub async fn current(&self) -> Arc<ModerationLists> {
        self.current.read().await.clone()
    }

    /// Reread the file and swap the lists in. A failed read keeps the old lists.
    pub async fn refresh(&self) -> Result<Arc<ModerationLists>, RegistryError> {
        let Some(path) = &self.path else {
            return Ok(self.current().await);
        };
        let lists = Arc::new(ModerationLists::load(path).await?);
        debug!(
            urls = lists.flagged_urls.len(),
            identities = lists.flagged_identities.len(),
            "Moderation lists reloaded"
        );
        *self.current.write().await = lists.clone();
        Ok(lists)
    }

    /// Reload on a fixed interval until the returned handle is aborted.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "Moderation reload task started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the lists were just loaded.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    warn!(error = %e, "Moderation reload failed, keeping previous lists");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBody;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn upvote(key: &SigningKey, href: &str) -> Message {
        Message::sign(key, MessageBody::Upvote { href: href.into() }, 1)
    }

    #[test]
    fn test_flagged_url_matches_any_spelling() {
        let lists = ModerationLists::new(["https://www.Spam.com/x/"], []);
        let key = SigningKey::generate(&mut OsRng);
        let msg = upvote(&key, "http://spam.com/x#top");
        assert!(lists.is_flagged(&msg, &msg.identity));
        let ok = upvote(&key, "https://spam.com/y");
        assert!(!lists.is_flagged(&ok, &ok.identity));
    }

    #[test]
    fn test_flagged_owner_hides_delegate_messages() {
        let owner = Identity::from_bytes([9u8; 32]);
        let lists = ModerationLists::new(Vec::<String>::new(), [owner]);
        let delegate = SigningKey::generate(&mut OsRng);
        let msg = upvote(&delegate, "https://example.com");
        assert!(lists.is_flagged(&msg, &owner));
        assert!(!lists.is_flagged(&msg, &msg.identity));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("moderation.json");
        let id = Identity::from_bytes([1u8; 32]);
        std::fs::write(
            &path,
            format!(
                r#"{{"flaggedUrls": ["HTTP://Example.com/a/"], "flaggedIdentities": ["{}"]}}"#,
                id
            ),
        )
        .unwrap();

        let lists = ModerationLists::load(&path).await.unwrap();
        assert!(lists.flagged_urls.contains("https://example.com/a"));
        assert!(lists.flagged_identities.contains(&id));
    }

    #[tokio::test]
    async fn test_cache_picks_up_edited_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("moderation.json");
        std::fs::write(&path, r#"{"flaggedUrls": []}"#).unwrap();

        let cache = ModerationCache::open(path.clone()).await.unwrap();
        let key = SigningKey::generate(&mut OsRng);
        let msg = upvote(&key, "https://spam.example/");
        assert!(!cache.current().await.is_flagged(&msg, &msg.identity));

        std::fs::write(&path, r#"{"flaggedUrls": ["https://spam.example"]}"#).unwrap();
        cache.refresh().await.unwrap();
        assert!(cache.current().await.is_flagged(&msg, &msg.identity));

        // A broken edit keeps the last good lists.
        std::fs::write(&path, "{not json").unwrap();
        assert!(cache.refresh().await.is_err());
        assert!(cache.current().await.is_flagged(&msg, &msg.identity));
    }

    #[tokio::test]
    async fn test_fixed_cache_refresh_is_a_no_op() {
        let lists = ModerationLists::new(["https://spam.example"], []);
        let cache = ModerationCache::fixed(lists.clone());
        assert_eq!(*cache.refresh().await.unwrap(), lists);
    }
}
