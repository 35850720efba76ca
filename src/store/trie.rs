//! Merkle radix trie over content hashes
//!
//! 16-ary trie keyed by the hex digits of each [`ContentHash`]. A key sits as
//! a leaf at the shallowest depth where no other key shares its prefix, so the
//! shape (and every digest) depends only on the key set, never on insertion
//! order. Inserting rehashes only the branches on the key's path.
//!
//! ```text
//! leaf digest   = SHA-256(0x00 hash)
//! branch digest = SHA-256(0x01 (nibble child-digest)*)   children in nibble order
//! empty root    = 32 zero bytes
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::message::{ContentHash, TrieDigest};

const RADIX: usize = 16;

/// One line of a subtree manifest exchanged during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestEntry {
    /// A stored leaf under the requested prefix.
    Leaf(ContentHash),
    /// A branch too large to list; descend by requesting its prefix.
    Subtree {
        prefix: Vec<u8>,
        digest: TrieDigest,
        count: u64,
    },
}

enum Node {
    Leaf(ContentHash),
    Branch(Box<Branch>),
}

struct Branch {
    children: [Option<Node>; RADIX],
    digest: TrieDigest,
    count: u64,
}

impl Node {
    fn digest(&self) -> TrieDigest {
        match self {
            Node::Leaf(hash) => leaf_digest(hash),
            Node::Branch(branch) => branch.digest,
        }
    }

    fn collect(&self, out: &mut Vec<ContentHash>) {
        match self {
            Node::Leaf(hash) => out.push(*hash),
            Node::Branch(branch) => {
                for child in branch.children.iter().flatten() {
                    child.collect(out);
                }
            }
        }
    }
}

impl Branch {
    fn new() -> Self {
        Self {
            children: Default::default(),
            digest: TrieDigest::default(),
            count: 0,
        }
    }

    fn insert(&mut self, key: ContentHash, depth: usize) -> bool {
        let slot = &mut self.children[key.nibble(depth) as usize];
        let inserted = insert_at(slot, key, depth + 1);
        if inserted {
            self.count += 1;
            self.rehash();
        }
        inserted
    }

    fn rehash(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update([0x01]);
        for (nibble, child) in self.children.iter().enumerate() {
            if let Some(child) = child {
                hasher.update([nibble as u8]);
                hasher.update(child.digest().as_bytes());
            }
        }
        self.digest = TrieDigest::from_bytes(hasher.finalize().into());
    }
}

fn leaf_digest(hash: &ContentHash) -> TrieDigest {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(hash.as_bytes());
    TrieDigest::from_bytes(hasher.finalize().into())
}

fn insert_at(slot: &mut Option<Node>, key: ContentHash, depth: usize) -> bool {
    match slot {
        None => {
            *slot = Some(Node::Leaf(key));
            true
        }
        Some(Node::Leaf(existing)) if *existing == key => false,
        Some(Node::Leaf(existing)) => {
            // Split: push the resident leaf one level down, then insert.
            let existing = *existing;
            let mut branch = Branch::new();
            branch.children[existing.nibble(depth) as usize] = Some(Node::Leaf(existing));
            branch.count = 1;
            let inserted = branch.insert(key, depth);
            *slot = Some(Node::Branch(Box::new(branch)));
            inserted
        }
        Some(Node::Branch(branch)) => branch.insert(key, depth),
    }
}

/// Whether `prefix` is a valid nibble path.
pub fn valid_prefix(prefix: &[u8]) -> bool {
    prefix.len() <= ContentHash::NIBBLES && prefix.iter().all(|n| (*n as usize) < RADIX)
}

fn matches_prefix(key: &ContentHash, prefix: &[u8]) -> bool {
    prefix
        .iter()
        .enumerate()
        .all(|(i, nibble)| key.nibble(i) == *nibble)
}

#[derive(Default)]
pub struct MerkleTrie {
    root: Option<Node>,
}

impl MerkleTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `key`; false if it was already present.
    pub fn insert(&mut self, key: ContentHash) -> bool {
        insert_at(&mut self.root, key, 0)
    }

    pub fn root(&self) -> TrieDigest {
        self.root
            .as_ref()
            .map(Node::digest)
            .unwrap_or_default()
    }

    pub fn len(&self) -> u64 {
        match &self.root {
            None => 0,
            Some(Node::Leaf(_)) => 1,
            Some(Node::Branch(branch)) => branch.count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Node occupying exactly `prefix`, or the shallower leaf covering it.
    fn locate(&self, prefix: &[u8]) -> Option<(&Node, usize)> {
        let mut node = self.root.as_ref()?;
        for (depth, nibble) in prefix.iter().enumerate() {
            match node {
                Node::Leaf(_) => return Some((node, depth)),
                Node::Branch(branch) => {
                    node = branch.children.get(*nibble as usize)?.as_ref()?;
                }
            }
        }
        Some((node, prefix.len()))
    }

    /// Digest of the node sitting exactly at `prefix`, if any.
    pub fn digest_at(&self, prefix: &[u8]) -> Option<TrieDigest> {
        match self.locate(prefix)? {
            (node, depth) if depth == prefix.len() => Some(node.digest()),
            _ => None,
        }
    }

    /// Describe the subtree under `prefix`.
    ///
    /// Subtrees holding at most `leaf_limit` keys are listed leaf by leaf;
    /// larger ones are summarized one level down so the requester can prune
    /// children whose digests already match.
    pub fn manifest(&self, prefix: &[u8], leaf_limit: u64) -> Vec<ManifestEntry> {
        let Some((node, _)) = self.locate(prefix) else {
            return Vec::new();
        };
        match node {
            Node::Leaf(hash) if matches_prefix(hash, prefix) => vec![ManifestEntry::Leaf(*hash)],
            Node::Leaf(_) => Vec::new(),
            Node::Branch(branch) if branch.count <= leaf_limit => {
                let mut leaves = Vec::with_capacity(branch.count as usize);
                node.collect(&mut leaves);
                leaves.into_iter().map(ManifestEntry::Leaf).collect()
            }
            Node::Branch(branch) => branch
                .children
                .iter()
                .enumerate()
                .filter_map(|(nibble, child)| {
                    child.as_ref().map(|child| match child {
                        Node::Leaf(hash) => ManifestEntry::Leaf(*hash),
                        Node::Branch(sub) => {
                            let mut child_prefix = prefix.to_vec();
                            child_prefix.push(nibble as u8);
                            ManifestEntry::Subtree {
                                prefix: child_prefix,
                                digest: sub.digest,
                                count: sub.count,
                            }
                        }
                    })
                })
                .collect(),
        }
    }

    /// Every key in nibble order.
    pub fn keys(&self) -> Vec<ContentHash> {
        let mut out = Vec::with_capacity(self.len() as usize);
        if let Some(root) = &self.root {
            root.collect(&mut out);
        }
        out
    }
}
