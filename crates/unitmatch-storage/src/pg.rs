//! Postgres-backed store. Runtime-checked queries only, so the crate builds
//! without a live database.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{info, info_span, Instrument};
use unitmatch_core::{LeaseType, Listing, ListingId, MatchStatus};
use unitmatch_engine::MatchOutput;

use crate::{
    MatchReader, MatchStore, MatcherRunRecord, PersistReport, PersistRows, RunCounts, StoreError,
    StoredGroup, StoredMember, StoredPair,
};

/// Rows per multi-row INSERT.
const INSERT_CHUNK: usize = 500;

const LISTING_COLUMNS: &str = r#"
    id, platform_code, external_id, source_ref, address_code, address_text,
    lease_type, rent_amount, deposit_amount, area_exclusive_m2, area_gross_m2,
    room_count, floor, total_floor, lat, lng, image_count, created_at
"#;

#[derive(Debug, Clone)]
pub struct PgMatchStore {
    pool: PgPool,
}

impl PgMatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

async fn upsert_run(
    tx: &mut Transaction<'_, Postgres>,
    rows: &PersistRows,
) -> Result<(i64, bool), StoreError> {
    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO matcher_runs (
            run_key, algorithm_version, rules_json, metadata_json,
            listing_count, candidate_pairs, auto_match, review_required,
            distinct_count, merged_groups, started_at, finished_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (run_key) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(rows.run_key)
    .bind(&rows.algorithm_version)
    .bind(&rows.rules)
    .bind(&rows.metadata)
    .bind(rows.counts.listing_count)
    .bind(rows.counts.candidate_pairs)
    .bind(rows.counts.auto_match)
    .bind(rows.counts.review_required)
    .bind(rows.counts.distinct)
    .bind(rows.counts.merged_groups)
    .bind(rows.started_at)
    .bind(rows.finished_at)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(id) = inserted {
        return Ok((id, true));
    }
    let id: i64 = sqlx::query_scalar("SELECT id FROM matcher_runs WHERE run_key = $1")
        .bind(rows.run_key)
        .fetch_one(&mut **tx)
        .await?;
    Ok((id, false))
}

async fn insert_pairs(
    tx: &mut Transaction<'_, Postgres>,
    matcher_run_id: i64,
    rows: &PersistRows,
) -> Result<usize, StoreError> {
    let mut inserted = 0usize;
    for chunk in rows.pairs.chunks(INSERT_CHUNK) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO match_pairs (matcher_run_id, source_listing_id, target_listing_id, \
             score, status, address_score, distance_score, area_score, price_score, \
             attribute_score, reason_json) ",
        );
        qb.push_values(chunk.iter(), |mut b, pair| {
            b.push_bind(matcher_run_id)
                .push_bind(pair.source_listing_id)
                .push_bind(pair.target_listing_id)
                .push_bind(pair.score)
                .push_bind(pair.status.as_str())
                .push_bind(pair.address_score)
                .push_bind(pair.distance_score)
                .push_bind(pair.area_score)
                .push_bind(pair.price_score)
                .push_bind(pair.attribute_score)
                .push_bind(pair.reason_json.clone());
        });
        qb.push(" ON CONFLICT (matcher_run_id, source_listing_id, target_listing_id) DO NOTHING");
        let result = qb.build().execute(&mut **tx).await?;
        inserted += result.rows_affected() as usize;
    }
    Ok(inserted)
}

async fn replace_groups(
    tx: &mut Transaction<'_, Postgres>,
    matcher_run_id: i64,
    rows: &PersistRows,
) -> Result<(usize, usize), StoreError> {
    sqlx::query("DELETE FROM match_groups WHERE matcher_run_id = $1")
        .bind(matcher_run_id)
        .execute(&mut **tx)
        .await?;

    let mut members_written = 0usize;
    for group in &rows.groups {
        let group_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO match_groups (matcher_run_id, canonical_key, status, member_count, reason_json)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(matcher_run_id)
        .bind(&group.canonical_key)
        .bind(group.status.as_str())
        .bind(i32::try_from(group.members.len()).unwrap_or(i32::MAX))
        .bind(&group.reason_json)
        .fetch_one(&mut **tx)
        .await?;

        for chunk in group.members.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO match_group_members (group_id, listing_id, member_score) ",
            );
            qb.push_values(chunk.iter(), |mut b, member| {
                b.push_bind(group_id)
                    .push_bind(member.listing_id)
                    .push_bind(member.member_score);
            });
            qb.build().execute(&mut **tx).await?;
        }
        members_written += group.members.len();
    }
    Ok((rows.groups.len(), members_written))
}

#[async_trait]
impl MatchStore for PgMatchStore {
    async fn persist(&self, output: &MatchOutput) -> Result<PersistReport, StoreError> {
        let rows = PersistRows::from_output(output)?;
        let span = info_span!("persist_run", run_key = %rows.run_key, base_run_id = %rows.base_run_id);

        async {
            let mut tx = self.pool.begin().await?;
            let (matcher_run_id, run_created) = upsert_run(&mut tx, &rows).await?;
            let pairs_inserted = insert_pairs(&mut tx, matcher_run_id, &rows).await?;
            let (groups_written, members_written) =
                replace_groups(&mut tx, matcher_run_id, &rows).await?;
            tx.commit().await?;

            let report = PersistReport {
                matcher_run_id,
                run_created,
                pairs_inserted,
                pairs_skipped: rows.pairs.len().saturating_sub(pairs_inserted),
                groups_written,
                members_written,
            };
            info!(
                matcher_run_id,
                run_created,
                pairs_inserted = report.pairs_inserted,
                pairs_skipped = report.pairs_skipped,
                groups_written,
                "persisted matcher run"
            );
            Ok::<_, StoreError>(report)
        }
        .instrument(span)
        .await
    }
}

fn parse_status(table: &'static str, raw: &str) -> Result<MatchStatus, StoreError> {
    raw.parse().map_err(|err| StoreError::Corrupt {
        table,
        detail: format!("{err}"),
    })
}

fn run_from_row(row: &PgRow) -> Result<MatcherRunRecord, StoreError> {
    let metadata: serde_json::Value = row.try_get("metadata_json")?;
    let base_run_id = metadata
        .get("base_run_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StoreError::Corrupt {
            table: "matcher_runs",
            detail: "metadata_json.base_run_id missing".to_string(),
        })?
        .to_string();
    Ok(MatcherRunRecord {
        id: row.try_get("id")?,
        run_key: row.try_get("run_key")?,
        base_run_id,
        algorithm_version: row.try_get("algorithm_version")?,
        rules: row.try_get("rules_json")?,
        metadata,
        counts: RunCounts {
            listing_count: row.try_get("listing_count")?,
            candidate_pairs: row.try_get("candidate_pairs")?,
            auto_match: row.try_get("auto_match")?,
            review_required: row.try_get("review_required")?,
            distinct: row.try_get("distinct_count")?,
            merged_groups: row.try_get("merged_groups")?,
        },
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn pair_from_row(row: &PgRow) -> Result<StoredPair, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(StoredPair {
        matcher_run_id: row.try_get("matcher_run_id")?,
        source_listing_id: row.try_get("source_listing_id")?,
        target_listing_id: row.try_get("target_listing_id")?,
        score: row.try_get("score")?,
        status: parse_status("match_pairs", &status)?,
        address_score: row.try_get("address_score")?,
        distance_score: row.try_get("distance_score")?,
        area_score: row.try_get("area_score")?,
        price_score: row.try_get("price_score")?,
        attribute_score: row.try_get("attribute_score")?,
        reason_json: row.try_get("reason_json")?,
    })
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StoreError> {
    let lease_type: Option<String> = row.try_get("lease_type")?;
    Ok(Listing {
        platform_code: row.try_get("platform_code")?,
        external_id: row.try_get("external_id")?,
        source_ref: row.try_get("source_ref")?,
        address_code: row.try_get("address_code")?,
        address_text: row.try_get("address_text")?,
        lease_type: lease_type.as_deref().and_then(LeaseType::parse),
        rent_amount: row.try_get("rent_amount")?,
        deposit_amount: row.try_get("deposit_amount")?,
        area_exclusive_m2: row.try_get("area_exclusive_m2")?,
        area_gross_m2: row.try_get("area_gross_m2")?,
        room_count: row.try_get("room_count")?,
        floor: row.try_get("floor")?,
        total_floor: row.try_get("total_floor")?,
        lat: row.try_get("lat")?,
        lng: row.try_get("lng")?,
        image_count: row.try_get("image_count")?,
        created_at: Some(row.try_get("created_at")?),
        ..Listing::with_id(row.try_get("id")?)
    })
}

#[async_trait]
impl MatchReader for PgMatchStore {
    async fn default_base_run_id(&self) -> Result<Option<String>, StoreError> {
        let id = sqlx::query_scalar(
            r#"
            SELECT base_run_id
              FROM collection_runs
             GROUP BY base_run_id
             ORDER BY COUNT(DISTINCT platform_code) DESC, MAX(started_at) DESC, base_run_id
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn latest_finished_run(
        &self,
        base_run_id: &str,
    ) -> Result<Option<MatcherRunRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, run_key, algorithm_version, rules_json, metadata_json,
                   listing_count, candidate_pairs, auto_match, review_required,
                   distinct_count, merged_groups, started_at, finished_at
              FROM matcher_runs
             WHERE metadata_json ->> 'base_run_id' = $1
             ORDER BY finished_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(base_run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn count_pairs(
        &self,
        matcher_run_id: i64,
        status: Option<MatchStatus>,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM match_pairs
             WHERE matcher_run_id = $1
               AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(matcher_run_id)
        .bind(status.map(MatchStatus::as_str))
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn pairs_page(
        &self,
        matcher_run_id: i64,
        status: Option<MatchStatus>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<StoredPair>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT matcher_run_id, source_listing_id, target_listing_id, score, status,
                   address_score, distance_score, area_score, price_score, attribute_score,
                   reason_json
              FROM match_pairs
             WHERE matcher_run_id = $1
               AND ($2::text IS NULL OR status = $2)
             ORDER BY score DESC, source_listing_id, target_listing_id
             LIMIT $3 OFFSET $4
            "#,
        )
        .bind(matcher_run_id)
        .bind(status.map(MatchStatus::as_str))
        .bind(i64::from(limit))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pair_from_row).collect()
    }

    async fn groups(&self, matcher_run_id: i64) -> Result<Vec<StoredGroup>, StoreError> {
        let group_rows = sqlx::query(
            r#"
            SELECT id, matcher_run_id, canonical_key, status, member_count, reason_json
              FROM match_groups
             WHERE matcher_run_id = $1
             ORDER BY id
            "#,
        )
        .bind(matcher_run_id)
        .fetch_all(&self.pool)
        .await?;

        let member_rows = sqlx::query(
            r#"
            SELECT m.group_id, m.listing_id, m.member_score
              FROM match_group_members m
              JOIN match_groups g ON g.id = m.group_id
             WHERE g.matcher_run_id = $1
             ORDER BY m.group_id, m.listing_id
            "#,
        )
        .bind(matcher_run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut members: HashMap<i64, Vec<StoredMember>> = HashMap::new();
        for row in member_rows {
            members
                .entry(row.try_get("group_id")?)
                .or_default()
                .push(StoredMember {
                    listing_id: row.try_get("listing_id")?,
                    member_score: row.try_get("member_score")?,
                });
        }

        let mut out = Vec::with_capacity(group_rows.len());
        for row in group_rows {
            let id: i64 = row.try_get("id")?;
            let status: String = row.try_get("status")?;
            out.push(StoredGroup {
                id,
                matcher_run_id: row.try_get("matcher_run_id")?,
                canonical_key: row.try_get("canonical_key")?,
                status: parse_status("match_groups", &status)?,
                member_count: row.try_get("member_count")?,
                reason_json: row.try_get("reason_json")?,
                members: members.remove(&id).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn listings_by_ids(&self, ids: &[ListingId]) -> Result<Vec<Listing>, StoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ANY($1) ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn listings_for_base_run(&self, base_run_id: &str) -> Result<Vec<Listing>, StoreError> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE base_run_id = $1 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(base_run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }
}
