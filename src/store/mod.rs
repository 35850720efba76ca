//! Content store - append-only, content-addressed leaf set
//!
//! Handles:
//! - Idempotent insertion keyed by content hash
//! - Insertion-sequence ordering for stable pagination
//! - Incremental root digest via the Merkle trie
//! - SQLite durability (optional, in-memory for tests)
//!
//! `add` is the only mutation. The durable append runs before the write lock
//! is taken; the lock then covers only the in-memory trie and leaf splice, so
//! readers see either the whole insertion or none of it and never wait on
//! disk. Callers serialize `add` through the [`writer`] task.

pub mod persist;
pub mod trie;
pub mod writer;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{QueryError, StoreError};
use crate::message::{ContentHash, Message, MessageKind, TrieDigest};
use persist::LeafDb;
use trie::{ManifestEntry, MerkleTrie};

pub use writer::{spawn_writer, InsertedLeaf, WriterHandle};

/// An accepted message and its place in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// Local insertion sequence, starting at 1.
    pub seq: u64,
    pub hash: ContentHash,
    pub message: Message,
}

/// Result of [`LeafStore::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted(Leaf),
    AlreadyPresent(ContentHash),
}

/// Opaque pagination token: the last insertion sequence a page returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor(u64);

impl Cursor {
    pub fn after(seq: u64) -> Self {
        Self(seq)
    }

    pub fn seq(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(QueryError::PaginationInvalid(format!("malformed cursor '{}'", s)));
        }
        u64::from_str_radix(s, 16)
            .map(Cursor)
            .map_err(|_| QueryError::PaginationInvalid(format!("malformed cursor '{}'", s)))
    }
}

impl Serialize for Cursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Restriction applied while enumerating leaves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafFilter {
    /// Allowed kinds; empty means every kind.
    pub kinds: BTreeSet<MessageKind>,
    /// Minimum message timestamp ("startDatetime").
    pub start_datetime: Option<u64>,
}

impl LeafFilter {
    pub fn matches(&self, message: &Message) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&message.kind()))
            && self.start_datetime.map_or(true, |start| message.timestamp >= start)
    }
}

/// One page of leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub leaves: Vec<Leaf>,
    /// Present when more leaves may follow.
    pub next_cursor: Option<Cursor>,
}

#[derive(Default)]
struct Inner {
    leaves: Vec<Leaf>,
    index: HashMap<ContentHash, usize>,
    trie: MerkleTrie,
}

pub struct LeafStore {
    inner: RwLock<Inner>,
    db: Option<Mutex<LeafDb>>,
}

impl LeafStore {
    /// Volatile store, used by tests and ephemeral nodes.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            db: None,
        }
    }

    /// Open the durable store in `data_dir`, reloading every prior leaf.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let db = LeafDb::open(data_dir)?;
        let mut inner = Inner::default();

        for (expected, stored) in db.load_all()?.into_iter().enumerate() {
            if stored.seq != expected as u64 + 1 {
                return Err(StoreError::Corrupt(format!(
                    "sequence gap: expected {}, found {}",
                    expected + 1,
                    stored.seq
                )));
            }
            inner.trie.insert(stored.hash);
            inner.index.insert(stored.hash, inner.leaves.len());
            inner.leaves.push(Leaf {
                seq: stored.seq,
                hash: stored.hash,
                message: stored.message,
            });
        }

        let root = inner.trie.root();
        match db.stored_root()? {
            Some(stored) if stored != root => {
                warn!(%stored, rebuilt = %root, "Stored root differs from rebuilt trie, using rebuilt");
            }
            _ => {}
        }
        info!(leaves = inner.leaves.len(), %root, "Leaf store loaded");

        Ok(Self {
            inner: RwLock::new(inner),
            db: Some(Mutex::new(db)),
        })
    }

    /// Insert `message` unless a leaf with the same content hash exists.
    pub fn add(&self, message: Message) -> Result<AddOutcome, StoreError> {
        let hash = message.content_hash();
        // Held for the whole insert: orders durable appends.
        let mut db = self
            .db
            .as_ref()
            .map(|db| db.lock().unwrap_or_else(PoisonError::into_inner));

        let seq = {
            let inner = self.read();
            if inner.index.contains_key(&hash) {
                return Ok(AddOutcome::AlreadyPresent(hash));
            }
            inner.leaves.len() as u64 + 1
        };

        if let Some(db) = db.as_mut() {
            db.append_leaf(seq, &hash, &message)?;
        }

        let (leaf, root) = {
            let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let inner = &mut *guard;
            // In-memory stores have no db lock, so a concurrent add may win.
            if inner.index.contains_key(&hash) {
                return Ok(AddOutcome::AlreadyPresent(hash));
            }
            let position = inner.leaves.len();
            let leaf = Leaf {
                seq: position as u64 + 1,
                hash,
                message,
            };
            inner.trie.insert(hash);
            inner.index.insert(hash, position);
            inner.leaves.push(leaf.clone());
            (leaf, inner.trie.root())
        };

        if let Some(db) = db.as_mut() {
            if let Err(e) = db.record_root(&root) {
                warn!(error = %e, %root, "Failed to record root digest");
            }
        }
        debug!(seq = leaf.seq, %hash, %root, "Leaf inserted");
        Ok(AddOutcome::Inserted(leaf))
    }

    pub fn has(&self, hash: &ContentHash) -> bool {
        self.read().index.contains_key(hash)
    }

    pub fn get(&self, hash: &ContentHash) -> Option<Leaf> {
        let inner = self.read();
        inner.index.get(hash).map(|i| inner.leaves[*i].clone())
    }

    pub fn root(&self) -> TrieDigest {
        self.read().trie.root()
    }

    pub fn len(&self) -> u64 {
        self.read().leaves.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Page through leaves in insertion order, after `cursor`.
    pub fn leaves(
        &self,
        filter: &LeafFilter,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<Page, QueryError> {
        self.leaves_where(filter, cursor, limit, |_| true)
    }

    /// Like [`LeafStore::leaves`], with an extra read-time predicate.
    ///
    /// Rejected leaves do not count toward `limit`, so a page is only short
    /// when the log is exhausted.
    pub fn leaves_where(
        &self,
        filter: &LeafFilter,
        cursor: Option<Cursor>,
        limit: usize,
        mut keep: impl FnMut(&Leaf) -> bool,
    ) -> Result<Page, QueryError> {
        if limit == 0 {
            return Err(QueryError::PaginationInvalid(
                "limit must be at least 1".to_string(),
            ));
        }
        let inner = self.read();
        let start = cursor.map_or(0, |c| c.seq()) as usize;

        let mut page = Vec::with_capacity(limit.min(inner.leaves.len()));
        let mut next_cursor = None;
        for leaf in inner.leaves.iter().skip(start) {
            if !filter.matches(&leaf.message) || !keep(leaf) {
                continue;
            }
            page.push(leaf.clone());
            if page.len() == limit {
                if leaf.seq < inner.leaves.len() as u64 {
                    next_cursor = Some(Cursor::after(leaf.seq));
                }
                break;
            }
        }

        Ok(Page {
            leaves: page,
            next_cursor,
        })
    }

    /// Every leaf in insertion order, for whole-log replays.
    pub fn snapshot(&self) -> Vec<Leaf> {
        self.read().leaves.clone()
    }

    /// Trie manifest under `prefix` (see [`MerkleTrie::manifest`]).
    pub fn manifest(&self, prefix: &[u8], leaf_limit: u64) -> Vec<ManifestEntry> {
        self.read().trie.manifest(prefix, leaf_limit)
    }

    pub fn digest_at(&self, prefix: &[u8]) -> Option<TrieDigest> {
        self.read().trie.digest_at(prefix)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}
