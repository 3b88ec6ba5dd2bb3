//! Entity-resolution engine: blocking, pairwise scoring, classification and
//! clustering of rental listings.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span};
use unitmatch_core::{parse_input_document, InputDocument, InputError, MatchStatus};
use uuid::Uuid;

pub mod blocking;
pub mod cluster;
pub mod reports;
pub mod rules;
pub mod score;

pub use blocking::{generate_candidates, BlockingStats, CandidateSet, OversizedBucket};
pub use cluster::{build_groups, GroupMember, GroupReason, MatchGroup, UnionFind};
pub use reports::{ReportWriter, RunReport};
pub use rules::{ConfigError, RulesConfig, RulesSnapshot, ALGORITHM_VERSION};
pub use score::{DataNote, PairReason, PairScorer, ScoredPair};

pub const CRATE_NAME: &str = "unitmatch-engine";

/// Process configuration read from the environment. CLI flags override it.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub database_url: Option<String>,
    pub rules_path: PathBuf,
    pub reports_dir: PathBuf,
    pub scoring_threads: usize,
    pub write_reports: bool,
}

impl MatchConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            rules_path: std::env::var("UNITMATCH_RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("rules/matcher.yaml")),
            reports_dir: std::env::var("UNITMATCH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            scoring_threads: std::env::var("UNITMATCH_SCORING_THREADS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            write_reports: std::env::var("UNITMATCH_WRITE_REPORTS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSummary {
    pub count: usize,
    pub candidate_pairs: usize,
    pub auto_match: usize,
    pub review_required: usize,
    pub distinct: usize,
    pub merged_groups: usize,
    #[serde(default)]
    pub oversized_wildcard_buckets: Vec<OversizedBucket>,
}

/// Everything one scoring run produces; serialized as the output payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutput {
    pub run_id: String,
    pub matcher_run_key: Uuid,
    pub started_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub rules_snapshot: RulesSnapshot,
    pub input_summary: InputSummary,
    pub pairs: Vec<ScoredPair>,
    pub match_groups: Vec<MatchGroup>,
}

pub struct MatchEngine {
    rules: RulesConfig,
    scoring_threads: usize,
}

impl MatchEngine {
    pub fn new(rules: RulesConfig) -> Self {
        Self {
            rules,
            scoring_threads: 0,
        }
    }

    /// 0 uses one thread per available core.
    pub fn with_scoring_threads(mut self, threads: usize) -> Self {
        self.scoring_threads = threads;
        self
    }

    pub fn rules(&self) -> &RulesConfig {
        &self.rules
    }

    pub fn run(&self, input: &InputDocument) -> Result<MatchOutput> {
        let started_at = Utc::now();
        let matcher_run_key = Uuid::new_v4();
        let span = info_span!("match_run", run_id = %input.run_id, %matcher_run_key);
        let _guard = span.enter();

        let listings = &input.listings;
        let candidates = generate_candidates(listings, &self.rules.blocking);
        info!(
            listings = listings.len(),
            candidates = candidates.pairs.len(),
            exhaustive = candidates.stats.exhaustive,
            "candidate generation complete"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.scoring_threads)
            .thread_name(|i| format!("unitmatch-score-{i}"))
            .build()
            .context("building scoring thread pool")?;
        let scorer = PairScorer::new(&self.rules);
        let mut pairs: Vec<ScoredPair> = pool.install(|| {
            candidates
                .pairs
                .par_iter()
                .map(|&(i, j)| scorer.score(&listings[i], &listings[j]))
                .collect()
        });
        pairs.sort_by_key(|p| (p.source_listing_id, p.target_listing_id));

        let match_groups = build_groups(listings, &pairs);

        let count = |status: MatchStatus| pairs.iter().filter(|p| p.status == status).count();
        let input_summary = InputSummary {
            count: listings.len(),
            candidate_pairs: pairs.len(),
            auto_match: count(MatchStatus::AutoMatch),
            review_required: count(MatchStatus::ReviewRequired),
            distinct: count(MatchStatus::Distinct),
            merged_groups: match_groups.len(),
            oversized_wildcard_buckets: candidates.stats.oversized_buckets,
        };
        info!(
            auto_match = input_summary.auto_match,
            review_required = input_summary.review_required,
            distinct = input_summary.distinct,
            groups = input_summary.merged_groups,
            "scoring complete"
        );

        Ok(MatchOutput {
            run_id: input.run_id.clone(),
            matcher_run_key,
            started_at,
            generated_at: Utc::now(),
            rules_snapshot: self.rules.snapshot(),
            input_summary,
            pairs,
            match_groups,
        })
    }
}

pub fn load_input_document(path: &Path) -> Result<InputDocument, InputError> {
    let bytes = std::fs::read(path).map_err(|source| InputError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_input_document(&bytes)
}

/// Reads an input document, scores it and optionally writes the run report.
/// Persistence is left to the caller.
pub async fn run_match_from_file(
    config: &MatchConfig,
    input_path: &Path,
) -> Result<(MatchOutput, Option<RunReport>)> {
    let rules = RulesConfig::load_or_default(&config.rules_path)
        .with_context(|| format!("loading rules from {}", config.rules_path.display()))?;
    let input = load_input_document(input_path)
        .with_context(|| format!("loading input {}", input_path.display()))?;

    let engine = MatchEngine::new(rules).with_scoring_threads(config.scoring_threads);
    let output = engine.run(&input)?;

    let report = if config.write_reports {
        Some(ReportWriter::new(&config.reports_dir).write(&output).await?)
    } else {
        None
    };
    Ok((output, report))
}
