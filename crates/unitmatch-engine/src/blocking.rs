//! Candidate-pair generation.
//!
//! Listings are bucketed by `{address}|r{price}|a{area}`. A listing with both
//! buckets lands in its own bucket and the 8 neighbouring ones so values near
//! a bucket boundary still meet. Every listing also lands in the wildcard
//! bucket `{address}|r*|a*`, which pairs listings that only share an address.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use unitmatch_core::Listing;

use crate::rules::BlockingRules;

const MISSING_ADDRESS_KEY: &str = "na";
const WILDCARD_SUFFIX: &str = "|r*|a*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OversizedBucket {
    pub key: String,
    pub size: usize,
    pub cap: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingStats {
    pub exhaustive: bool,
    pub buckets: usize,
    pub oversized_buckets: Vec<OversizedBucket>,
}

/// Index pairs into the listing slice, always `left < right`, ascending.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pub pairs: Vec<(usize, usize)>,
    pub stats: BlockingStats,
}

#[derive(Debug)]
pub struct BlockingIndex<'a> {
    rules: &'a BlockingRules,
    buckets: BTreeMap<String, Vec<usize>>,
}

impl<'a> BlockingIndex<'a> {
    pub fn build(listings: &[Listing], rules: &'a BlockingRules) -> Self {
        let mut buckets: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, listing) in listings.iter().enumerate() {
            for key in bucket_keys(listing, rules) {
                buckets.entry(key).or_default().push(idx);
            }
        }
        Self { rules, buckets }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn members(&self, key: &str) -> Option<&[usize]> {
        self.buckets.get(key).map(Vec::as_slice)
    }

    pub fn candidate_pairs(&self) -> CandidateSet {
        let mut seen: BTreeSet<(usize, usize)> = BTreeSet::new();
        let mut stats = BlockingStats {
            exhaustive: false,
            buckets: self.buckets.len(),
            oversized_buckets: Vec::new(),
        };

        for (key, members) in &self.buckets {
            let members = if key.ends_with(WILDCARD_SUFFIX) && members.len() > self.rules.wildcard_cap {
                warn!(
                    bucket = %key,
                    size = members.len(),
                    cap = self.rules.wildcard_cap,
                    "wildcard bucket exceeds cap; pairing only the first members"
                );
                stats.oversized_buckets.push(OversizedBucket {
                    key: key.clone(),
                    size: members.len(),
                    cap: self.rules.wildcard_cap,
                });
                &members[..self.rules.wildcard_cap]
            } else {
                members.as_slice()
            };

            for (pos, &left) in members.iter().enumerate() {
                for &right in &members[pos + 1..] {
                    if left != right {
                        seen.insert((left.min(right), left.max(right)));
                    }
                }
            }
        }

        debug!(buckets = stats.buckets, candidates = seen.len(), "blocking complete");
        CandidateSet {
            pairs: seen.into_iter().collect(),
            stats,
        }
    }
}

pub fn address_key(listing: &Listing) -> String {
    listing
        .address_code
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .unwrap_or(MISSING_ADDRESS_KEY)
        .to_string()
}

/// Every bucket a listing is inserted into: up to 9 price/area buckets plus
/// the wildcard.
pub fn bucket_keys(listing: &Listing, rules: &BlockingRules) -> Vec<String> {
    let address = address_key(listing);
    let price = listing
        .rent_amount
        .map(|rent| (rent / rules.price_bucket_width).round() as i64);
    let area = listing
        .preferred_area()
        .map(|area| (area / rules.area_bucket_width).round() as i64);

    let mut keys = Vec::with_capacity(10);
    if let (Some(price), Some(area)) = (price, area) {
        for dp in -1..=1 {
            for da in -1..=1 {
                keys.push(format!(
                    "{address}|r{}|a{}",
                    price.saturating_add(dp),
                    area.saturating_add(da)
                ));
            }
        }
    }
    keys.push(format!("{address}{WILDCARD_SUFFIX}"));
    keys
}

/// Candidate pairs for a batch. Small batches skip blocking entirely.
pub fn generate_candidates(listings: &[Listing], rules: &BlockingRules) -> CandidateSet {
    if listings.len() <= rules.exhaustive_max_listings {
        let n = listings.len();
        let pairs = (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect::<Vec<_>>();
        return CandidateSet {
            pairs,
            stats: BlockingStats {
                exhaustive: true,
                ..Default::default()
            },
        };
    }
    BlockingIndex::build(listings, rules).candidate_pairs()
}
