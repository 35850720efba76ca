//! Karma - deterministic replay of engagement
//!
//! Leaves are replayed oldest first. The first author to reference a
//! canonical resource becomes its submitter, and every later engagement with
//! the same resource credits that submitter, never the engaging author.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::message::Identity;
use crate::query::AttributedLeaf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KarmaEntry {
    pub identity: Identity,
    pub karma: u64,
}

/// Score every author that submitted at least one resource.
///
/// Output is sorted by karma descending, then identity ascending.
pub fn karma(leaves: &[AttributedLeaf]) -> Vec<KarmaEntry> {
    let mut ordered: Vec<&AttributedLeaf> = leaves.iter().collect();
    ordered.sort_by_key(|l| (l.leaf.message.timestamp, l.leaf.seq));

    let mut submitters: HashMap<String, Identity> = HashMap::new();
    let mut points: HashMap<Identity, u64> = HashMap::new();

    for entry in ordered {
        let resource = entry.leaf.message.canonical_href();
        let submitter = *submitters.entry(resource).or_insert(entry.author);
        *points.entry(submitter).or_default() += 1;
    }

    let mut scores: Vec<KarmaEntry> = points
        .into_iter()
        .map(|(identity, karma)| KarmaEntry { identity, karma })
        .collect();
    sort_scores(&mut scores);
    scores
}

/// Join karma with the allowlist; listed identities without points score 0.
pub fn leaderboard(scores: &[KarmaEntry], allowlist: &BTreeSet<Identity>) -> Vec<KarmaEntry> {
    let by_identity: HashMap<Identity, u64> =
        scores.iter().map(|s| (s.identity, s.karma)).collect();

    let mut board: Vec<KarmaEntry> = allowlist
        .iter()
        .map(|identity| KarmaEntry {
            identity: *identity,
            karma: by_identity.get(identity).copied().unwrap_or(0),
        })
        .collect();
    sort_scores(&mut board);
    board
}

fn sort_scores(scores: &mut [KarmaEntry]) {
    scores.sort_by(|a, b| b.karma.cmp(&a.karma).then_with(|| a.identity.cmp(&b.identity)));
}
