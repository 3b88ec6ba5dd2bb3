//! In-process store with the same semantics as the Postgres one. Used for
//! dry runs and tests.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use unitmatch_core::{Listing, ListingId, MatchStatus};
use unitmatch_engine::MatchOutput;

use crate::{
    pick_default_base_run, CollectionRun, MatchReader, MatchStore, MatcherRunRecord,
    PersistReport, PersistRows, StoreError, StoredGroup, StoredPair,
};

#[derive(Debug, Default)]
struct MemoryState {
    runs: Vec<MatcherRunRecord>,
    pairs: BTreeMap<(i64, ListingId, ListingId), StoredPair>,
    groups: Vec<StoredGroup>,
    next_run_id: i64,
    next_group_id: i64,
    listings: BTreeMap<ListingId, (String, Listing)>,
    collection_runs: Vec<CollectionRun>,
}

#[derive(Debug, Default)]
pub struct MemoryMatchStore {
    state: Mutex<MemoryState>,
}

impl MemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds collaborator listing rows for `base_run_id`, replacing rows with
    /// the same id.
    pub async fn insert_listings(
        &self,
        base_run_id: &str,
        listings: impl IntoIterator<Item = Listing>,
    ) {
        let mut state = self.state.lock().await;
        for listing in listings {
            state
                .listings
                .insert(listing.id, (base_run_id.to_string(), listing));
        }
    }

    pub async fn insert_collection_run(&self, run: CollectionRun) {
        self.state.lock().await.collection_runs.push(run);
    }

    pub async fn run_count(&self) -> usize {
        self.state.lock().await.runs.len()
    }

    pub async fn pair_count(&self) -> usize {
        self.state.lock().await.pairs.len()
    }
}

#[async_trait]
impl MatchStore for MemoryMatchStore {
    async fn persist(&self, output: &MatchOutput) -> Result<PersistReport, StoreError> {
        let rows = PersistRows::from_output(output)?;
        let mut state = self.state.lock().await;

        let (matcher_run_id, run_created) =
            match state.runs.iter().find(|r| r.run_key == rows.run_key) {
                Some(existing) => (existing.id, false),
                None => {
                    state.next_run_id += 1;
                    let id = state.next_run_id;
                    state.runs.push(MatcherRunRecord {
                        id,
                        run_key: rows.run_key,
                        base_run_id: rows.base_run_id.clone(),
                        algorithm_version: rows.algorithm_version.clone(),
                        rules: rows.rules.clone(),
                        metadata: rows.metadata.clone(),
                        counts: rows.counts,
                        started_at: rows.started_at,
                        finished_at: rows.finished_at,
                    });
                    (id, true)
                }
            };

        let mut report = PersistReport {
            matcher_run_id,
            run_created,
            ..PersistReport::default()
        };

        for pair in rows.pairs {
            let key = (matcher_run_id, pair.source_listing_id, pair.target_listing_id);
            if state.pairs.contains_key(&key) {
                report.pairs_skipped += 1;
            } else {
                state.pairs.insert(key, pair.into_stored(matcher_run_id));
                report.pairs_inserted += 1;
            }
        }

        state.groups.retain(|g| g.matcher_run_id != matcher_run_id);
        for group in rows.groups {
            state.next_group_id += 1;
            report.members_written += group.members.len();
            report.groups_written += 1;
            let stored = StoredGroup {
                id: state.next_group_id,
                matcher_run_id,
                canonical_key: group.canonical_key,
                status: group.status,
                member_count: i32::try_from(group.members.len()).unwrap_or(i32::MAX),
                reason_json: group.reason_json,
                members: group.members,
            };
            state.groups.push(stored);
        }

        debug!(
            matcher_run_id,
            pairs_inserted = report.pairs_inserted,
            pairs_skipped = report.pairs_skipped,
            "persisted run in memory"
        );
        Ok(report)
    }
}

#[async_trait]
impl MatchReader for MemoryMatchStore {
    async fn default_base_run_id(&self) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(pick_default_base_run(&state.collection_runs))
    }

    async fn latest_finished_run(
        &self,
        base_run_id: &str,
    ) -> Result<Option<MatcherRunRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.base_run_id == base_run_id)
            .max_by_key(|r| (r.finished_at, r.id))
            .cloned())
    }

    async fn count_pairs(
        &self,
        matcher_run_id: i64,
        status: Option<MatchStatus>,
    ) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .pairs
            .values()
            .filter(|p| p.matcher_run_id == matcher_run_id)
            .filter(|p| status.map_or(true, |s| p.status == s))
            .count() as u64)
    }

    async fn pairs_page(
        &self,
        matcher_run_id: i64,
        status: Option<MatchStatus>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<StoredPair>, StoreError> {
        let state = self.state.lock().await;
        let mut pairs: Vec<&StoredPair> = state
            .pairs
            .values()
            .filter(|p| p.matcher_run_id == matcher_run_id)
            .filter(|p| status.map_or(true, |s| p.status == s))
            .collect();
        pairs.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.source_listing_id.cmp(&b.source_listing_id))
                .then(a.target_listing_id.cmp(&b.target_listing_id))
        });
        Ok(pairs
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn groups(&self, matcher_run_id: i64) -> Result<Vec<StoredGroup>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .groups
            .iter()
            .filter(|g| g.matcher_run_id == matcher_run_id)
            .cloned()
            .collect())
    }

    async fn listings_by_ids(&self, ids: &[ListingId]) -> Result<Vec<Listing>, StoreError> {
        let wanted: HashSet<ListingId> = ids.iter().copied().collect();
        let state = self.state.lock().await;
        Ok(state
            .listings
            .values()
            .filter(|(_, l)| wanted.contains(&l.id))
            .map(|(_, l)| l.clone())
            .collect())
    }

    async fn listings_for_base_run(&self, base_run_id: &str) -> Result<Vec<Listing>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .listings
            .values()
            .filter(|(base, _)| base == base_run_id)
            .map(|(_, l)| l.clone())
            .collect())
    }
}
