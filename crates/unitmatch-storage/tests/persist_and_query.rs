use std::path::Path;
use std::sync::Arc;

use unitmatch_core::MatchStatus;
use unitmatch_engine::{load_input_document, MatchEngine, RulesConfig};
use unitmatch_storage::{
    MatchQueryService, MatchStore, MemoryMatchStore, PairQuery, PgMatchStore,
};

fn fixture_path() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample/listings.json")
}

#[tokio::test]
async fn fixture_run_persists_and_reads_back() {
    let input = load_input_document(&fixture_path()).expect("fixture parses");
    let output = MatchEngine::new(RulesConfig::default())
        .run(&input)
        .expect("run");

    let store = Arc::new(MemoryMatchStore::new());
    store
        .insert_listings(&input.run_id, input.listings.clone())
        .await;

    let first = store.persist(&output).await.expect("persist");
    let again = store.persist(&output).await.expect("persist again");
    assert_eq!(first.pairs_inserted, 15);
    assert_eq!(again.pairs_inserted, 0);
    assert_eq!(again.pairs_skipped, 15);
    assert_eq!(store.pair_count().await, 15);

    let service = MatchQueryService::new(store.clone());
    let summary = service.summary(Some(input.run_id.as_str())).await.expect("summary");
    assert_eq!(summary.counts.listing_count, 6);
    assert_eq!(summary.counts.auto_match, 3);

    let review = service
        .pairs(&PairQuery {
            base_run_id: Some(input.run_id.clone()),
            status: Some(MatchStatus::AutoMatch),
            ..Default::default()
        })
        .await
        .expect("pairs");
    assert_eq!(review.total, 3);

    let groups = service.groups(Some(input.run_id.as_str())).await.expect("groups");
    assert_eq!(groups.len(), 1);
    let ids: Vec<i64> = groups[0].members.iter().map(|m| m.listing_id).collect();
    assert_eq!(ids, vec![101, 102, 103]);
    assert_eq!(groups[0].members[2].area_m2, Some(39.2));
}

/// Runs only when `DATABASE_URL` points at a disposable Postgres database.
#[tokio::test]
async fn postgres_persist_is_idempotent() {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        return;
    };
    let store = PgMatchStore::connect(&url).await.expect("connect");
    store.migrate().await.expect("migrate");

    let input = load_input_document(&fixture_path()).expect("fixture parses");
    let output = MatchEngine::new(RulesConfig::default())
        .run(&input)
        .expect("run");

    let first = store.persist(&output).await.expect("persist");
    let second = store.persist(&output).await.expect("persist again");
    assert!(first.run_created);
    assert!(!second.run_created);
    assert_eq!(second.matcher_run_id, first.matcher_run_id);
    assert_eq!(second.pairs_inserted, 0);
    assert_eq!(second.pairs_skipped, output.pairs.len());
    assert_eq!(second.groups_written, first.groups_written);
}
