//! Read-side service over a [`MatchReader`]: run summaries, ranked pairs,
//! hydrated groups and the collapsed listing view.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use unitmatch_core::{collapse_duplicates, Listing, ListingId, MatchStatus};

use crate::{MatchReader, MatcherRunRecord, RunCounts, StoreError, StoredGroup, StoredPair};

pub const MAX_PER_PAGE: u32 = 500;
pub const DEFAULT_PER_PAGE: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairQuery {
    pub base_run_id: Option<String>,
    pub status: Option<MatchStatus>,
    /// 1-based.
    pub page: u32,
    pub per_page: u32,
}

impl Default for PairQuery {
    fn default() -> Self {
        Self {
            base_run_id: None,
            status: None,
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub base_run_id: Option<String>,
    pub matcher_run: Option<MatcherRunRecord>,
    pub counts: RunCounts,
}

/// Listing fields shown next to a group member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDisplay {
    pub listing_id: ListingId,
    pub platform_code: Option<String>,
    pub address: Option<String>,
    pub rent_amount: Option<f64>,
    pub deposit_amount: Option<f64>,
    pub area_m2: Option<f64>,
    pub image_count: Option<i32>,
    pub member_score: i32,
}

impl ListingDisplay {
    fn new(listing: &Listing, member_score: i32) -> Self {
        Self {
            listing_id: listing.id,
            platform_code: listing.platform_code.clone(),
            address: listing
                .address_text
                .clone()
                .or_else(|| listing.address_code.clone()),
            rent_amount: listing.rent_amount,
            deposit_amount: listing.deposit_amount,
            area_m2: listing.preferred_area(),
            image_count: listing.image_count,
            member_score,
        }
    }

    fn missing(listing_id: ListingId, member_score: i32) -> Self {
        Self {
            listing_id,
            platform_code: None,
            address: None,
            rent_amount: None,
            deposit_amount: None,
            area_m2: None,
            image_count: None,
            member_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HydratedGroup {
    pub group_id: i64,
    pub canonical_key: String,
    pub status: MatchStatus,
    pub member_count: i32,
    pub reason_json: serde_json::Value,
    pub members: Vec<ListingDisplay>,
}

#[derive(Clone)]
pub struct MatchQueryService {
    reader: Arc<dyn MatchReader>,
}

impl MatchQueryService {
    pub fn new(reader: Arc<dyn MatchReader>) -> Self {
        Self { reader }
    }

    async fn resolve_base_run(
        &self,
        base_run_id: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        match base_run_id {
            Some(id) => Ok(Some(id.to_string())),
            None => self.reader.default_base_run_id().await,
        }
    }

    async fn resolve_run(
        &self,
        base_run_id: Option<&str>,
    ) -> Result<(Option<String>, Option<MatcherRunRecord>), StoreError> {
        let Some(base) = self.resolve_base_run(base_run_id).await? else {
            return Ok((None, None));
        };
        let run = self.reader.latest_finished_run(&base).await?;
        debug!(
            base_run_id = %base,
            matcher_run_id = ?run.as_ref().map(|r| r.id),
            "resolved matcher run"
        );
        Ok((Some(base), run))
    }

    /// Zeroed counts when no matcher run references the base run.
    pub async fn summary(&self, base_run_id: Option<&str>) -> Result<MatchSummary, StoreError> {
        let (base_run_id, run) = self.resolve_run(base_run_id).await?;
        Ok(MatchSummary {
            base_run_id,
            counts: run.as_ref().map(|r| r.counts).unwrap_or_default(),
            matcher_run: run,
        })
    }

    pub async fn pairs(&self, query: &PairQuery) -> Result<Page<StoredPair>, StoreError> {
        let page = query.page.max(1);
        let per_page = query.per_page.clamp(1, MAX_PER_PAGE);
        let (_, run) = self.resolve_run(query.base_run_id.as_deref()).await?;
        let Some(run) = run else {
            return Ok(Page {
                items: vec![],
                page,
                per_page,
                total: 0,
            });
        };

        let total = self.reader.count_pairs(run.id, query.status).await?;
        let offset = u64::from(page - 1) * u64::from(per_page);
        let items = self
            .reader
            .pairs_page(run.id, query.status, per_page, offset)
            .await?;
        Ok(Page {
            items,
            page,
            per_page,
            total,
        })
    }

    pub async fn groups(
        &self,
        base_run_id: Option<&str>,
    ) -> Result<Vec<HydratedGroup>, StoreError> {
        let (_, run) = self.resolve_run(base_run_id).await?;
        let Some(run) = run else {
            return Ok(vec![]);
        };
        let groups = self.reader.groups(run.id).await?;

        let mut ids: Vec<ListingId> = groups
            .iter()
            .flat_map(|g| g.members.iter().map(|m| m.listing_id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        let listings: HashMap<ListingId, Listing> = self
            .reader
            .listings_by_ids(&ids)
            .await?
            .into_iter()
            .map(|l| (l.id, l))
            .collect();

        Ok(groups
            .into_iter()
            .map(|group| hydrate(group, &listings))
            .collect())
    }

    /// Listings of the base run with cross-crawl duplicates collapsed.
    pub async fn listings(&self, base_run_id: Option<&str>) -> Result<Vec<Listing>, StoreError> {
        let Some(base) = self.resolve_base_run(base_run_id).await? else {
            return Ok(vec![]);
        };
        let listings = self.reader.listings_for_base_run(&base).await?;
        let before = listings.len();
        let collapsed = collapse_duplicates(listings);
        debug!(base_run_id = %base, before, after = collapsed.len(), "collapsed listings");
        Ok(collapsed)
    }
}

fn hydrate(group: StoredGroup, listings: &HashMap<ListingId, Listing>) -> HydratedGroup {
    let members = group
        .members
        .iter()
        .map(|m| match listings.get(&m.listing_id) {
            Some(listing) => ListingDisplay::new(listing, m.member_score),
            None => ListingDisplay::missing(m.listing_id, m.member_score),
        })
        .collect();
    HydratedGroup {
        group_id: group.id,
        canonical_key: group.canonical_key,
        status: group.status,
        member_count: group.member_count,
        reason_json: group.reason_json,
        members,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectionRun, MatchStore, MemoryMatchStore};
    use chrono::{TimeZone, Utc};
    use unitmatch_core::InputDocument;
    use unitmatch_engine::{MatchEngine, RulesConfig};

    fn listing(id: ListingId, platform: &str, rent: f64, area: f64) -> Listing {
        Listing {
            platform_code: Some(platform.into()),
            external_id: Some(format!("{platform}-{id}")),
            address_code: Some("1168010100".into()),
            address_text: Some("Seoul Gangnam-gu Yeoksam-dong 736-1".into()),
            rent_amount: Some(rent),
            deposit_amount: Some(1000.0),
            area_exclusive_m2: Some(area),
            room_count: Some(1),
            floor: Some(4),
            lat: Some(37.50061),
            lng: Some(127.03642),
            image_count: Some(id as i32),
            ..Listing::with_id(id)
        }
    }

    fn crawl(platform: &str) -> CollectionRun {
        CollectionRun {
            id: format!("collect-1-{platform}"),
            base_run_id: "collect-1".into(),
            platform_code: platform.into(),
            started_at: Utc.with_ymd_and_hms(2026, 10, 15, 6, 0, 0).unwrap(),
            finished_at: None,
        }
    }

    async fn seeded() -> Arc<MemoryMatchStore> {
        let listings = vec![
            listing(1, "zigbang", 65.0, 33.0),
            listing(2, "dabang", 65.0, 33.1),
            listing(3, "naver", 120.0, 59.9),
        ];
        let store = Arc::new(MemoryMatchStore::new());
        store.insert_listings("collect-1", listings.clone()).await;
        for platform in ["zigbang", "dabang", "naver"] {
            store.insert_collection_run(crawl(platform)).await;
        }
        let output = MatchEngine::new(RulesConfig::default())
            .run(&InputDocument {
                run_id: "collect-1".into(),
                listings,
            })
            .unwrap();
        store.persist(&output).await.unwrap();
        store
    }

    #[tokio::test]
    async fn no_matcher_run_gives_zeroed_summary() {
        let service = MatchQueryService::new(Arc::new(MemoryMatchStore::new()));

        let summary = service.summary(None).await.unwrap();
        assert_eq!(summary, MatchSummary::default());

        let summary = service.summary(Some("never-scored")).await.unwrap();
        assert_eq!(summary.base_run_id.as_deref(), Some("never-scored"));
        assert_eq!(summary.counts, RunCounts::default());
        assert!(summary.matcher_run.is_none());

        let pairs = service.pairs(&PairQuery::default()).await.unwrap();
        assert!(pairs.items.is_empty());
        assert_eq!(pairs.total, 0);
        assert!(service.groups(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn default_base_run_resolves_to_latest_matcher_run() {
        let service = MatchQueryService::new(seeded().await);
        let summary = service.summary(None).await.unwrap();
        assert_eq!(summary.base_run_id.as_deref(), Some("collect-1"));
        assert_eq!(summary.counts.listing_count, 3);
        assert_eq!(summary.counts.candidate_pairs, 3);
        assert_eq!(summary.counts.merged_groups, 1);
    }

    #[tokio::test]
    async fn pairs_are_paginated_and_clamped() {
        let service = MatchQueryService::new(seeded().await);

        let first = service
            .pairs(&PairQuery {
                per_page: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.total, 3);
        assert_eq!(first.items.len(), 2);
        assert_eq!(
            (first.items[0].source_listing_id, first.items[0].target_listing_id),
            (1, 2)
        );

        let clamped = service
            .pairs(&PairQuery {
                page: 0,
                per_page: 10_000,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(clamped.page, 1);
        assert_eq!(clamped.per_page, MAX_PER_PAGE);

        let auto_only = service
            .pairs(&PairQuery {
                status: Some(MatchStatus::AutoMatch),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(auto_only.total, 1);
        assert!(auto_only
            .items
            .iter()
            .all(|p| p.status == MatchStatus::AutoMatch));
    }

    #[tokio::test]
    async fn groups_carry_listing_display_fields() {
        let service = MatchQueryService::new(seeded().await);
        let groups = service.groups(Some("collect-1")).await.unwrap();
        assert_eq!(groups.len(), 1);

        let members = &groups[0].members;
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].listing_id, 1);
        assert_eq!(members[0].platform_code.as_deref(), Some("zigbang"));
        assert_eq!(
            members[0].address.as_deref(),
            Some("Seoul Gangnam-gu Yeoksam-dong 736-1")
        );
        assert_eq!(members[1].area_m2, Some(33.1));
        assert_eq!(members[1].image_count, Some(2));
    }

    #[tokio::test]
    async fn listing_view_collapses_recrawled_rows() {
        let store = Arc::new(MemoryMatchStore::new());
        store
            .insert_listings(
                "collect-1",
                vec![
                    listing(1, "zigbang", 65.0, 33.0),
                    Listing {
                        external_id: Some("zigbang-1".into()),
                        ..listing(2, "zigbang", 65.0, 34.0)
                    },
                    listing(3, "dabang", 65.0, 33.0),
                ],
            )
            .await;
        store.insert_collection_run(crawl("zigbang")).await;

        let service = MatchQueryService::new(store);
        let view = service.listings(None).await.unwrap();
        let ids: Vec<ListingId> = view.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
