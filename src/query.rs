//! Query engine - paginated views over the leaf store
//!
//! Views:
//! - `list`: the raw log, optionally filtered by type and start time
//! - `posts`: submissions from currently authorized authors, moderated
//! - `engagement`: the ranking input (every leaf kind, same filters)
//!
//! Revoked identities keep their leaves in the store; the authorization and
//! moderation filters here hide them from current views.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::message::{Identity, MessageKind};
use crate::moderation::ModerationLists;
use crate::registry::RegistrySnapshot;
use crate::store::{Cursor, Leaf, LeafFilter, LeafStore, Page};

pub const DEFAULT_MAX_PAGE_SIZE: usize = 1000;

/// Pagination request as accepted on the query boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    /// Cursor returned as `nextCursor` by the previous page.
    #[serde(default)]
    pub from: Option<Cursor>,
    #[serde(default)]
    pub amount: Option<usize>,
    #[serde(default)]
    pub types: Option<Vec<MessageKind>>,
    #[serde(default)]
    pub start_datetime: Option<u64>,
}

/// A leaf together with the identity it is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributedLeaf {
    #[serde(flatten)]
    pub leaf: Leaf,
    pub author: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostsPage {
    pub leaves: Vec<AttributedLeaf>,
    pub next_cursor: Option<Cursor>,
}

pub struct QueryEngine {
    store: Arc<LeafStore>,
    max_page_size: usize,
}

impl QueryEngine {
    pub fn new(store: Arc<LeafStore>, max_page_size: usize) -> Self {
        Self {
            store,
            max_page_size: max_page_size.max(1),
        }
    }

    /// Missing or zero amounts are rejected, oversized ones clamped.
    fn page_size(&self, amount: Option<usize>) -> Result<usize, QueryError> {
        match amount {
            None => Err(QueryError::PaginationInvalid("amount is required".to_string())),
            Some(0) => Err(QueryError::PaginationInvalid(
                "amount must be at least 1".to_string(),
            )),
            Some(n) => Ok(n.min(self.max_page_size)),
        }
    }

    /// Full log listing.
    pub fn list(&self, request: &ListRequest) -> Result<Page, QueryError> {
        let limit = self.page_size(request.amount)?;
        let filter = LeafFilter {
            kinds: request.types.iter().flatten().copied().collect(),
            start_datetime: request.start_datetime,
        };
        self.store.leaves(&filter, request.from, limit)
    }

    /// Submissions by currently authorized authors, minus moderated ones.
    ///
    /// `request.types` is ignored; this view is always submissions.
    pub fn posts(
        &self,
        request: &ListRequest,
        snapshot: &RegistrySnapshot,
        moderation: &ModerationLists,
    ) -> Result<PostsPage, QueryError> {
        let limit = self.page_size(request.amount)?;
        let filter = LeafFilter {
            kinds: [MessageKind::Submission].into_iter().collect(),
            start_datetime: request.start_datetime,
        };
        let page = self.store.leaves_where(&filter, request.from, limit, |leaf| {
            visible(leaf, snapshot, moderation)
        })?;

        Ok(PostsPage {
            leaves: page
                .leaves
                .into_iter()
                .map(|leaf| attribute(leaf, snapshot))
                .collect(),
            next_cursor: page.next_cursor,
        })
    }

    /// Every visible leaf, in insertion order. Each kind references a
    /// resource, so each one is a point in the karma replay.
    pub fn engagement(
        &self,
        snapshot: &RegistrySnapshot,
        moderation: &ModerationLists,
    ) -> Vec<AttributedLeaf> {
        self.store
            .snapshot()
            .into_iter()
            .filter(|leaf| visible(leaf, snapshot, moderation))
            .map(|leaf| attribute(leaf, snapshot))
            .collect()
    }
}

fn visible(leaf: &Leaf, snapshot: &RegistrySnapshot, moderation: &ModerationLists) -> bool {
    let signer = &leaf.message.identity;
    snapshot.is_authorized(signer) && !moderation.is_flagged(&leaf.message, &snapshot.resolve(signer))
}

fn attribute(leaf: Leaf, snapshot: &RegistrySnapshot) -> AttributedLeaf {
    let author = snapshot.resolve(&leaf.message.identity);
    AttributedLeaf { leaf, author }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageBody};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn engine(store: Arc<LeafStore>) -> QueryEngine {
        QueryEngine::new(store, 10)
    }

    fn add(store: &LeafStore, key: &SigningKey, body: MessageBody, ts: u64) {
        store.add(Message::sign(key, body, ts)).unwrap();
    }

    fn submission(href: &str) -> MessageBody {
        MessageBody::Submission {
            href: href.into(),
            title: "t".into(),
        }
    }

    #[test]
    fn test_amount_policy() {
        let store = Arc::new(LeafStore::in_memory());
        let key = SigningKey::generate(&mut OsRng);
        for n in 0..15 {
            add(&store, &key, submission(&format!("https://e.com/{}", n)), n);
        }
        let engine = engine(store);

        let missing = engine.list(&ListRequest::default()).unwrap_err();
        assert_eq!(missing.code(), "PaginationInvalid");
        let zero = ListRequest {
            amount: Some(0),
            ..Default::default()
        };
        assert!(engine.list(&zero).is_err());

        let huge = ListRequest {
            amount: Some(5000),
            ..Default::default()
        };
        let page = engine.list(&huge).unwrap();
        assert_eq!(page.leaves.len(), 10);
        assert!(page.next_cursor.is_some());
    }

    #[test]
    fn test_posts_hide_revoked_and_flagged() {
        let store = Arc::new(LeafStore::in_memory());
        let alice = SigningKey::generate(&mut OsRng);
        let mallory = SigningKey::generate(&mut OsRng);
        add(&store, &alice, submission("https://good.example"), 1);
        add(&store, &alice, submission("https://spam.example"), 2);
        add(&store, &mallory, submission("https://other.example"), 3);
        add(&store, &alice, MessageBody::Upvote { href: "https://good.example".into() }, 4);

        // Mallory was once allowlisted but has since been revoked.
        let snapshot = RegistrySnapshot::new([Identity::from_signing_key(&alice)], []);
        let moderation = ModerationLists::new(["https://spam.example"], []);
        let request = ListRequest {
            amount: Some(10),
            ..Default::default()
        };

        let posts = engine(store.clone())
            .posts(&request, &snapshot, &moderation)
            .unwrap();
        let hrefs: Vec<&str> = posts.leaves.iter().map(|l| l.leaf.message.href()).collect();
        assert_eq!(hrefs, vec!["https://good.example"]);
        // Leaves are never removed.
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_posts_page_fills_past_hidden_leaves() {
        let store = Arc::new(LeafStore::in_memory());
        let alice = SigningKey::generate(&mut OsRng);
        let revoked = SigningKey::generate(&mut OsRng);
        for n in 0..6 {
            add(&store, &revoked, submission(&format!("https://r.example/{}", n)), n);
            add(&store, &alice, submission(&format!("https://a.example/{}", n)), n);
        }
        let snapshot = RegistrySnapshot::new([Identity::from_signing_key(&alice)], []);
        let engine = engine(store);

        let mut cursor = None;
        let mut seen = 0;
        loop {
            let request = ListRequest {
                from: cursor,
                amount: Some(4),
                ..Default::default()
            };
            let page = engine
                .posts(&request, &snapshot, &ModerationLists::default())
                .unwrap();
            seen += page.leaves.len();
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, 6);
    }

    #[test]
    fn test_engagement_attributes_delegates() {
        let store = Arc::new(LeafStore::in_memory());
        let owner = Identity::from_bytes([4u8; 32]);
        let delegate = SigningKey::generate(&mut OsRng);
        add(&store, &delegate, submission("https://example.com"), 1);
        add(
            &store,
            &delegate,
            MessageBody::Comment {
                href: "https://example.com".into(),
                title: "nice".into(),
            },
            2,
        );

        let snapshot =
            RegistrySnapshot::new([owner], [(Identity::from_signing_key(&delegate), owner)]);
        let leaves = engine(store).engagement(&snapshot, &ModerationLists::default());
        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|l| l.author == owner));
    }

    #[test]
    fn test_every_accepted_kind_scores_one_point() {
        let store = Arc::new(LeafStore::in_memory());
        let a = SigningKey::generate(&mut OsRng);
        let b = SigningKey::generate(&mut OsRng);
        let href = "https://example.com/story";
        add(&store, &a, submission(href), 1);
        add(
            &store,
            &b,
            MessageBody::Comment {
                href: href.into(),
                title: "great read".into(),
            },
            2,
        );
        add(&store, &b, MessageBody::Upvote { href: href.into() }, 3);

        let snapshot = RegistrySnapshot::new(
            [Identity::from_signing_key(&a), Identity::from_signing_key(&b)],
            [],
        );
        let leaves = engine(store.clone()).engagement(&snapshot, &ModerationLists::default());
        let scores = crate::ranking::karma(&leaves);

        let total: u64 = scores.iter().map(|s| s.karma).sum();
        assert_eq!(total, store.len());
        assert_eq!(scores[0].identity, Identity::from_signing_key(&a));
        assert_eq!(scores[0].karma, 3);
    }

    #[test]
    fn test_list_request_json() {
        let request: ListRequest = serde_json::from_str(
            r#"{"amount": 3, "types": ["upvote"], "startDatetime": 100}"#,
        )
        .unwrap();
        assert_eq!(request.amount, Some(3));
        assert_eq!(request.types, Some(vec![MessageKind::Upvote]));
        assert_eq!(request.start_datetime, Some(100));
        assert_eq!(request.from, None);
    }
}
