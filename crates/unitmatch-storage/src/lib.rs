//! Persistence for matcher runs (pairs, groups, members) and the read-side
//! query service used by review tooling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use unitmatch_core::{Listing, ListingId, MatchStatus};
use unitmatch_engine::{MatchGroup, MatchOutput};
use uuid::Uuid;

pub mod memory;
pub mod pg;
pub mod query;

pub use memory::MemoryMatchStore;
pub use pg::PgMatchStore;
pub use query::{
    HydratedGroup, ListingDisplay, MatchQueryService, MatchSummary, Page, PairQuery,
    MAX_PER_PAGE,
};

pub const CRATE_NAME: &str = "unitmatch-storage";

/// Score recorded for a group member the engine did not score explicitly.
pub const DEFAULT_MEMBER_SCORE: i32 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serializing {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

impl StoreError {
    fn serialize(what: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Self::Serialize { what, source }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistReport {
    pub matcher_run_id: i64,
    pub run_created: bool,
    pub pairs_inserted: usize,
    pub pairs_skipped: usize,
    pub groups_written: usize,
    pub members_written: usize,
}

/// Per-run counters as stored on the `matcher_runs` row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub listing_count: i32,
    pub candidate_pairs: i32,
    pub auto_match: i32,
    pub review_required: i32,
    pub distinct: i32,
    pub merged_groups: i32,
}

impl RunCounts {
    pub fn from_output(output: &MatchOutput) -> Self {
        let s = &output.input_summary;
        Self {
            listing_count: clamp_count(s.count),
            candidate_pairs: clamp_count(s.candidate_pairs),
            auto_match: clamp_count(s.auto_match),
            review_required: clamp_count(s.review_required),
            distinct: clamp_count(s.distinct),
            merged_groups: clamp_count(s.merged_groups),
        }
    }
}

fn clamp_count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherRunRecord {
    pub id: i64,
    pub run_key: Uuid,
    pub base_run_id: String,
    pub algorithm_version: String,
    pub rules: serde_json::Value,
    pub metadata: serde_json::Value,
    pub counts: RunCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPair {
    pub matcher_run_id: i64,
    pub source_listing_id: ListingId,
    pub target_listing_id: ListingId,
    pub score: i32,
    pub status: MatchStatus,
    pub address_score: f64,
    pub distance_score: f64,
    pub area_score: f64,
    pub price_score: f64,
    pub attribute_score: f64,
    pub reason_json: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMember {
    pub listing_id: ListingId,
    pub member_score: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredGroup {
    pub id: i64,
    pub matcher_run_id: i64,
    pub canonical_key: String,
    pub status: MatchStatus,
    pub member_count: i32,
    pub reason_json: serde_json::Value,
    pub members: Vec<StoredMember>,
}

/// One platform crawl inside a base collection run. Written by the
/// ingestion side; read here to pick a default base run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub id: String,
    pub base_run_id: String,
    pub platform_code: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Writes one scored output atomically. Re-persisting the same output
    /// reuses its run row, skips existing pairs and rewrites the groups.
    async fn persist(&self, output: &MatchOutput) -> Result<PersistReport, StoreError>;
}

#[async_trait]
pub trait MatchReader: Send + Sync {
    /// Base run covering the most distinct platforms, newest start first on ties.
    async fn default_base_run_id(&self) -> Result<Option<String>, StoreError>;

    async fn latest_finished_run(
        &self,
        base_run_id: &str,
    ) -> Result<Option<MatcherRunRecord>, StoreError>;

    async fn count_pairs(
        &self,
        matcher_run_id: i64,
        status: Option<MatchStatus>,
    ) -> Result<u64, StoreError>;

    /// Pairs ordered by score descending, then by the id pair.
    async fn pairs_page(
        &self,
        matcher_run_id: i64,
        status: Option<MatchStatus>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<StoredPair>, StoreError>;

    async fn groups(&self, matcher_run_id: i64) -> Result<Vec<StoredGroup>, StoreError>;

    async fn listings_by_ids(&self, ids: &[ListingId]) -> Result<Vec<Listing>, StoreError>;

    async fn listings_for_base_run(&self, base_run_id: &str) -> Result<Vec<Listing>, StoreError>;
}

/// Rows derived from one output, shaped for insertion. Building them up front
/// means serialization failures surface before any write starts.
#[derive(Debug, Clone)]
pub(crate) struct PersistRows {
    pub run_key: Uuid,
    pub base_run_id: String,
    pub algorithm_version: String,
    pub rules: serde_json::Value,
    pub metadata: serde_json::Value,
    pub counts: RunCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pairs: Vec<PairRow>,
    pub groups: Vec<GroupRow>,
}

#[derive(Debug, Clone)]
pub(crate) struct PairRow {
    pub source_listing_id: ListingId,
    pub target_listing_id: ListingId,
    pub score: i32,
    pub status: MatchStatus,
    pub address_score: f64,
    pub distance_score: f64,
    pub area_score: f64,
    pub price_score: f64,
    pub attribute_score: f64,
    pub reason_json: serde_json::Value,
}

impl PairRow {
    pub fn into_stored(self, matcher_run_id: i64) -> StoredPair {
        StoredPair {
            matcher_run_id,
            source_listing_id: self.source_listing_id,
            target_listing_id: self.target_listing_id,
            score: self.score,
            status: self.status,
            address_score: self.address_score,
            distance_score: self.distance_score,
            area_score: self.area_score,
            price_score: self.price_score,
            attribute_score: self.attribute_score,
            reason_json: self.reason_json,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GroupRow {
    pub canonical_key: String,
    pub status: MatchStatus,
    pub reason_json: serde_json::Value,
    pub members: Vec<StoredMember>,
}

impl PersistRows {
    pub fn from_output(output: &MatchOutput) -> Result<Self, StoreError> {
        let rules =
            serde_json::to_value(&output.rules_snapshot).map_err(StoreError::serialize("rules"))?;
        let oversized = serde_json::to_value(&output.input_summary.oversized_wildcard_buckets)
            .map_err(StoreError::serialize("run metadata"))?;
        let metadata = serde_json::json!({
            "base_run_id": output.run_id,
            "generated_at": output.generated_at,
            "oversized_wildcard_buckets": oversized,
        });

        let pairs = output
            .pairs
            .iter()
            .map(|p| {
                Ok(PairRow {
                    source_listing_id: p.source_listing_id,
                    target_listing_id: p.target_listing_id,
                    score: p.score,
                    status: p.status,
                    address_score: p.address_score,
                    distance_score: p.distance_score,
                    area_score: p.area_score,
                    price_score: p.price_score,
                    attribute_score: p.attribute_score,
                    reason_json: serde_json::to_value(&p.reason)
                        .map_err(StoreError::serialize("pair reason"))?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let groups = output
            .match_groups
            .iter()
            .map(|g| {
                Ok(GroupRow {
                    canonical_key: g.canonical_key.clone(),
                    status: g.status,
                    reason_json: serde_json::to_value(&g.reason)
                        .map_err(StoreError::serialize("group reason"))?,
                    members: member_rows(g),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Self {
            run_key: output.matcher_run_key,
            base_run_id: output.run_id.clone(),
            algorithm_version: output.rules_snapshot.algorithm_version.clone(),
            rules,
            metadata,
            counts: RunCounts::from_output(output),
            started_at: output.started_at,
            finished_at: output.generated_at,
            pairs,
            groups,
        })
    }
}

/// Members in id order, falling back to [`DEFAULT_MEMBER_SCORE`].
pub(crate) fn member_rows(group: &MatchGroup) -> Vec<StoredMember> {
    let mut members: Vec<StoredMember> = group
        .members
        .iter()
        .map(|&listing_id| StoredMember {
            listing_id,
            member_score: group
                .member_scores
                .iter()
                .find(|m| m.listing_id == listing_id)
                .map(|m| m.score)
                .unwrap_or(DEFAULT_MEMBER_SCORE),
        })
        .collect();
    members.sort_by_key(|m| m.listing_id);
    members.dedup_by_key(|m| m.listing_id);
    members
}

/// Picks the base run with the most distinct platforms; ties go to the run
/// whose newest crawl started last.
pub fn pick_default_base_run(runs: &[CollectionRun]) -> Option<String> {
    use std::collections::{BTreeMap, BTreeSet};

    let mut by_base: BTreeMap<&str, (BTreeSet<&str>, DateTime<Utc>)> = BTreeMap::new();
    for run in runs {
        let entry = by_base
            .entry(run.base_run_id.as_str())
            .or_insert_with(|| (BTreeSet::new(), run.started_at));
        entry.0.insert(run.platform_code.as_str());
        entry.1 = entry.1.max(run.started_at);
    }
    by_base
        .into_iter()
        .max_by(|(a_id, (a_platforms, a_start)), (b_id, (b_platforms, b_start))| {
            a_platforms
                .len()
                .cmp(&b_platforms.len())
                .then(a_start.cmp(b_start))
                .then(b_id.cmp(a_id))
        })
        .map(|(id, _)| id.to_string())
}
