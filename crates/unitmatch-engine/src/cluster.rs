//! Connected components over AUTO_MATCH edges.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use unitmatch_core::{Listing, ListingId, MatchStatus};
use uuid::Uuid;

use crate::score::ScoredPair;

/// Namespace for deterministic group canonical keys.
const GROUP_NAMESPACE: Uuid = Uuid::from_u128(0x5c1e_7a3b_90d4_4f6e_8a21_63b0_d9e4_1f07);

/// Disjoint sets over indices `0..n` with path compression and union by rank.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Returns false when `a` and `b` were already connected.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub listing_id: ListingId,
    /// Highest AUTO_MATCH edge score touching this member.
    pub score: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReason {
    pub edge_count: usize,
    pub forced_edges: usize,
    pub min_edge_score: i32,
    pub max_edge_score: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchGroup {
    pub group_id: usize,
    pub canonical_key: String,
    pub status: MatchStatus,
    pub members: Vec<ListingId>,
    pub member_count: usize,
    pub member_scores: Vec<GroupMember>,
    pub reason: GroupReason,
}

pub fn canonical_key(members: &[ListingId]) -> String {
    let material = members
        .iter()
        .map(ListingId::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!("unit-{}", Uuid::new_v5(&GROUP_NAMESPACE, material.as_bytes()))
}

#[derive(Default)]
struct Accumulator {
    members: Vec<ListingId>,
    best: BTreeMap<ListingId, i32>,
    edge_count: usize,
    forced_edges: usize,
    min_edge: Option<i32>,
    max_edge: Option<i32>,
}

/// Groups listings joined by AUTO_MATCH edges. Pairs whose ids are not in
/// `listings` are ignored. Singletons are dropped.
pub fn build_groups(listings: &[Listing], pairs: &[ScoredPair]) -> Vec<MatchGroup> {
    let index: HashMap<ListingId, usize> = listings
        .iter()
        .enumerate()
        .map(|(idx, l)| (l.id, idx))
        .collect();

    let edges = pairs
        .iter()
        .filter(|p| p.status == MatchStatus::AutoMatch)
        .filter_map(|p| {
            let a = *index.get(&p.source_listing_id)?;
            let b = *index.get(&p.target_listing_id)?;
            (a != b).then_some((a, b, p))
        })
        .collect::<Vec<_>>();

    let mut uf = UnionFind::new(listings.len());
    for &(a, b, _) in &edges {
        uf.union(a, b);
    }

    let mut components: BTreeMap<usize, Accumulator> = BTreeMap::new();
    for (idx, listing) in listings.iter().enumerate() {
        let root = uf.find(idx);
        components.entry(root).or_default().members.push(listing.id);
    }
    for &(a, b, pair) in &edges {
        let root = uf.find(a);
        let acc = components.entry(root).or_default();
        acc.edge_count += 1;
        if pair.reason.forced_match {
            acc.forced_edges += 1;
        }
        acc.min_edge = Some(acc.min_edge.map_or(pair.score, |m| m.min(pair.score)));
        acc.max_edge = Some(acc.max_edge.map_or(pair.score, |m| m.max(pair.score)));
        for idx in [a, b] {
            let id = listings[idx].id;
            let best = acc.best.entry(id).or_insert(pair.score);
            *best = (*best).max(pair.score);
        }
    }

    let mut groups = components
        .into_values()
        .filter(|acc| acc.members.len() > 1)
        .map(|mut acc| {
            acc.members.sort_unstable();
            let member_scores = acc
                .members
                .iter()
                .map(|id| GroupMember {
                    listing_id: *id,
                    score: acc.best.get(id).copied().unwrap_or(100),
                })
                .collect();
            MatchGroup {
                group_id: 0,
                canonical_key: canonical_key(&acc.members),
                status: MatchStatus::AutoMatch,
                member_count: acc.members.len(),
                members: acc.members,
                member_scores,
                reason: GroupReason {
                    edge_count: acc.edge_count,
                    forced_edges: acc.forced_edges,
                    min_edge_score: acc.min_edge.unwrap_or(100),
                    max_edge_score: acc.max_edge.unwrap_or(100),
                },
            }
        })
        .collect::<Vec<_>>();

    groups.sort_by_key(|g| g.members[0]);
    for (pos, group) in groups.iter_mut().enumerate() {
        group.group_id = pos + 1;
    }
    groups
}
