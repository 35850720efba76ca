//! kiwi-node: replicated, allowlist-gated log of signed link submissions
//!
//! Nodes admit signed messages (submissions, upvotes, comments) from
//! allowlisted or delegated signers, store them in a content-addressed leaf
//! set summarized by a Merkle root, and converge with peers through
//! anti-entropy sync. Reads are paginated views and a karma leaderboard
//! replayed from the log.

pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod message;
pub mod moderation;
pub mod p2p;
pub mod query;
pub mod ranking;
pub mod registry;
pub mod store;
pub mod sync;
pub mod validation;
