//! SQLite persistence for accepted leaves
//!
//! Leaves are append-only rows keyed by insertion sequence, encoded as
//! MessagePack. The root digest is recorded after each insert and checked
//! against the rebuilt trie on startup; a crash between the two writes only
//! leaves a stale root, which startup reports and replaces.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::StoreError;
use crate::message::{ContentHash, Message, TrieDigest};

const ROOT_KEY: &str = "root";

/// A row as loaded from disk, already checked against its content hash.
pub struct StoredLeaf {
    pub seq: u64,
    pub hash: ContentHash,
    pub message: Message,
}

pub struct LeafDb {
    db: Connection,
}

impl LeafDb {
    /// Open or create `leaves.db` inside `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("leaves.db");
        let db = Connection::open(&db_path)?;

        // Enable WAL mode for concurrent read access
        db.execute_batch("PRAGMA journal_mode=WAL;")?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS leaves (
                seq INTEGER PRIMARY KEY,
                hash BLOB NOT NULL UNIQUE,
                body BLOB NOT NULL,
                inserted_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;

        info!(path = %db_path.display(), "Leaf database opened");
        Ok(Self { db })
    }

    /// Append one leaf row.
    pub fn append_leaf(
        &mut self,
        seq: u64,
        hash: &ContentHash,
        message: &Message,
    ) -> Result<(), StoreError> {
        let body =
            rmp_serde::to_vec_named(message).map_err(|e| StoreError::Encoding(e.to_string()))?;
        self.db.execute(
            "INSERT INTO leaves (seq, hash, body) VALUES (?1, ?2, ?3)",
            params![seq as i64, hash.as_bytes().as_slice(), body],
        )?;
        Ok(())
    }

    /// Record the root digest after the latest append.
    pub fn record_root(&mut self, root: &TrieDigest) -> Result<(), StoreError> {
        self.db.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![ROOT_KEY, root.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    /// Every stored leaf in sequence order.
    pub fn load_all(&self) -> Result<Vec<StoredLeaf>, StoreError> {
        let mut stmt = self
            .db
            .prepare("SELECT seq, hash, body FROM leaves ORDER BY seq ASC")?;
        let rows = stmt.query_map([], |row| {
            let seq: i64 = row.get(0)?;
            let hash: Vec<u8> = row.get(1)?;
            let body: Vec<u8> = row.get(2)?;
            Ok((seq, hash, body))
        })?;

        let mut leaves = Vec::new();
        for row in rows {
            let (seq, hash, body) = row?;
            let hash: [u8; 32] = hash
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Corrupt(format!("bad hash length at seq {}", seq)))?;
            let hash = ContentHash::from_bytes(hash);
            let message: Message = rmp_serde::from_slice(&body)
                .map_err(|e| StoreError::Corrupt(format!("undecodable leaf {}: {}", seq, e)))?;
            if message.content_hash() != hash {
                return Err(StoreError::Corrupt(format!(
                    "leaf {} does not match its content hash",
                    seq
                )));
            }
            leaves.push(StoredLeaf {
                seq: seq as u64,
                hash,
                message,
            });
        }
        Ok(leaves)
    }

    /// Root digest recorded with the last append.
    pub fn stored_root(&self) -> Result<Option<TrieDigest>, StoreError> {
        let value: Option<Vec<u8>> = self
            .db
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![ROOT_KEY],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|bytes| {
                bytes
                    .as_slice()
                    .try_into()
                    .map(TrieDigest::from_bytes)
                    .map_err(|_| StoreError::Corrupt("bad root length".to_string()))
            })
            .transpose()
    }
}
