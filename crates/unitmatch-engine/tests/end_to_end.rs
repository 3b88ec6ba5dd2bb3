use std::path::Path;

use unitmatch_core::{InputDocument, Listing, MatchStatus};
use unitmatch_engine::rules::BlockingRules;
use unitmatch_engine::{load_input_document, MatchEngine, MatchOutput, RulesConfig};

fn fixture_root() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn pair(output: &MatchOutput, a: i64, b: i64) -> &unitmatch_engine::ScoredPair {
    output
        .pairs
        .iter()
        .find(|p| p.source_listing_id == a.min(b) && p.target_listing_id == a.max(b))
        .unwrap_or_else(|| panic!("pair ({a}, {b}) not scored"))
}

#[test]
fn identical_pair_merges_and_far_listing_stays_distinct() {
    let a = Listing {
        address_code: Some("1168010100".into()),
        rent_amount: Some(50.0),
        deposit_amount: Some(1000.0),
        area_exclusive_m2: Some(33.0),
        room_count: Some(2),
        lat: Some(37.5006),
        lng: Some(127.0364),
        ..Listing::with_id(1)
    };
    let b = Listing { id: 2, ..a.clone() };
    let c = Listing {
        address_code: Some("2611010100".into()),
        rent_amount: Some(150.0),
        area_exclusive_m2: Some(99.0),
        lat: Some(35.1031),
        lng: Some(129.0358),
        ..Listing::with_id(3)
    };

    let output = MatchEngine::new(RulesConfig::default())
        .run(&InputDocument {
            run_id: "collect-abc".into(),
            listings: vec![a, b, c],
        })
        .expect("run");

    let ab = pair(&output, 1, 2);
    assert_eq!(ab.status, MatchStatus::AutoMatch);
    assert!(ab.score >= 95, "score {}", ab.score);

    for (x, y) in [(1, 3), (2, 3)] {
        let p = pair(&output, x, y);
        assert_eq!(p.status, MatchStatus::Distinct);
        assert!(p.score < 30, "score {}", p.score);
    }

    assert_eq!(output.match_groups.len(), 1);
    assert_eq!(output.match_groups[0].members, vec![1, 2]);
    assert_eq!(output.match_groups[0].member_count, 2);
}

#[test]
fn sample_fixture_groups_cross_platform_duplicates() {
    let input = load_input_document(&fixture_root().join("fixtures/sample/listings.json"))
        .expect("fixture parses");
    assert_eq!(input.listings.len(), 6);

    let output = MatchEngine::new(RulesConfig::default()).run(&input).expect("run");
    let s = &output.input_summary;
    assert_eq!(s.count, 6);
    assert_eq!(s.candidate_pairs, 15);
    assert_eq!(s.auto_match, 3);
    assert_eq!(s.auto_match + s.review_required + s.distinct, s.candidate_pairs);
    assert_eq!(s.merged_groups, 1);
    assert_eq!(output.match_groups[0].members, vec![101, 102, 103]);

    let gross_vs_exclusive = pair(&output, 101, 103);
    assert_eq!(gross_vs_exclusive.area_score, 92.0);
    assert_eq!(pair(&output, 101, 104).status, MatchStatus::Distinct);
}

#[test]
fn blocking_keeps_the_same_groups_on_the_fixture() {
    let input = load_input_document(&fixture_root().join("fixtures/sample/listings.json"))
        .expect("fixture parses");
    let rules = RulesConfig {
        blocking: BlockingRules {
            exhaustive_max_listings: 0,
            ..Default::default()
        },
        ..Default::default()
    };

    let output = MatchEngine::new(rules).run(&input).expect("run");
    assert_eq!(output.input_summary.candidate_pairs, 6);
    assert_eq!(output.match_groups.len(), 1);
    assert_eq!(output.match_groups[0].members, vec![101, 102, 103]);
    assert!(output
        .pairs
        .iter()
        .all(|p| p.source_listing_id != 105 && p.target_listing_id != 105));
}

#[test]
fn rules_file_in_repo_is_valid() {
    let rules = RulesConfig::load(&fixture_root().join("rules/matcher.yaml")).expect("rules load");
    assert_eq!(rules, RulesConfig::default());
}
