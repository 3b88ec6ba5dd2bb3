use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use unitmatch_core::MatchStatus;
use unitmatch_engine::{run_match_from_file, MatchConfig};
use unitmatch_storage::{
    MatchQueryService, MatchStore, MemoryMatchStore, PairQuery, PgMatchStore,
};

#[derive(Debug, Parser)]
#[command(name = "unitmatch")]
#[command(about = "Rental listing matcher command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Score an input document and cluster duplicate listings.
    Match(MatchArgs),
    /// Apply database migrations.
    Migrate,
    /// Counts for the latest matcher run of a base run.
    Summary(BaseRunArgs),
    /// Ranked pairs of the latest matcher run.
    Pairs(PairsArgs),
    /// Duplicate groups with listing display fields.
    Groups(BaseRunArgs),
    /// Base-run listings with re-crawled duplicates collapsed.
    Listings(BaseRunArgs),
}

#[derive(Debug, Args)]
struct MatchArgs {
    /// Input document (`{run_id, listings}`).
    #[arg(long)]
    input: PathBuf,
    /// Rules YAML; overrides UNITMATCH_RULES_PATH.
    #[arg(long)]
    rules: Option<PathBuf>,
    /// Reports root; overrides UNITMATCH_REPORTS_DIR.
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    #[arg(long)]
    no_reports: bool,
    /// Also write the output payload to this path.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Scoring threads; 0 uses every core.
    #[arg(long)]
    threads: Option<usize>,
    /// Write the run to Postgres (DATABASE_URL). Without it the run is
    /// persisted to an in-memory store and discarded.
    #[arg(long)]
    persist: bool,
}

#[derive(Debug, Args)]
struct BaseRunArgs {
    /// Defaults to the base run covering the most platforms.
    #[arg(long)]
    base_run_id: Option<String>,
}

#[derive(Debug, Args)]
struct PairsArgs {
    #[command(flatten)]
    base: BaseRunArgs,
    /// AUTO_MATCH, REVIEW_REQUIRED or DISTINCT.
    #[arg(long)]
    status: Option<MatchStatus>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 50)]
    per_page: u32,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("UNITMATCH_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect_store(config: &MatchConfig) -> Result<PgMatchStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;
    PgMatchStore::connect(url)
        .await
        .context("connecting to Postgres")
}

async fn query_service(config: &MatchConfig) -> Result<MatchQueryService> {
    Ok(MatchQueryService::new(Arc::new(connect_store(config).await?)))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Without `--persist` the counters come from a discarded in-memory store.
fn store_label(persist: bool) -> &'static str {
    if persist {
        "postgres"
    } else {
        "memory(dry-run)"
    }
}

async fn run_match(mut config: MatchConfig, args: MatchArgs) -> Result<()> {
    if let Some(rules) = args.rules {
        config.rules_path = rules;
    }
    if let Some(dir) = args.reports_dir {
        config.reports_dir = dir;
    }
    if let Some(threads) = args.threads {
        config.scoring_threads = threads;
    }
    if args.no_reports {
        config.write_reports = false;
    }

    let (output, report) = run_match_from_file(&config, &args.input).await?;

    if let Some(path) = &args.output {
        let bytes = serde_json::to_vec_pretty(&output)?;
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("writing output {}", path.display()))?;
    }

    let store: Box<dyn MatchStore> = if args.persist {
        let store = connect_store(&config).await?;
        store.migrate().await.context("applying migrations")?;
        Box::new(store)
    } else {
        Box::new(MemoryMatchStore::new())
    };
    let persisted = store
        .persist(&output)
        .await
        .context("persisting matcher run")?;
    info!(
        matcher_run_id = persisted.matcher_run_id,
        store = store_label(args.persist),
        "run persisted"
    );

    let s = &output.input_summary;
    println!(
        "match complete: run_id={} matcher_run_key={} listings={} candidates={} auto={} review={} distinct={} groups={} store={} pairs_inserted={} pairs_skipped={}",
        output.run_id,
        output.matcher_run_key,
        s.count,
        s.candidate_pairs,
        s.auto_match,
        s.review_required,
        s.distinct,
        s.merged_groups,
        store_label(args.persist),
        persisted.pairs_inserted,
        persisted.pairs_skipped,
    );
    if let Some(report) = report {
        println!("reports: {}", report.dir.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = MatchConfig::from_env();

    match cli.command {
        Commands::Match(args) => run_match(config, args).await?,
        Commands::Migrate => {
            connect_store(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Summary(args) => {
            let service = query_service(&config).await?;
            print_json(&service.summary(args.base_run_id.as_deref()).await?)?;
        }
        Commands::Pairs(args) => {
            let service = query_service(&config).await?;
            let page = service
                .pairs(&PairQuery {
                    base_run_id: args.base.base_run_id,
                    status: args.status,
                    page: args.page,
                    per_page: args.per_page,
                })
                .await?;
            print_json(&page)?;
        }
        Commands::Groups(args) => {
            let service = query_service(&config).await?;
            print_json(&service.groups(args.base_run_id.as_deref()).await?)?;
        }
        Commands::Listings(args) => {
            let service = query_service(&config).await?;
            print_json(&service.listings(args.base_run_id.as_deref()).await?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_without_persist_is_labelled_a_dry_run() {
        let cli = Cli::try_parse_from(["unitmatch", "match", "--input", "in.json"]).unwrap();
        let Commands::Match(args) = cli.command else {
            panic!("expected match subcommand");
        };
        assert!(!args.persist);
        assert_eq!(store_label(args.persist), "memory(dry-run)");

        let cli =
            Cli::try_parse_from(["unitmatch", "match", "--input", "in.json", "--persist"]).unwrap();
        let Commands::Match(args) = cli.command else {
            panic!("expected match subcommand");
        };
        assert_eq!(store_label(args.persist), "postgres");
    }
}
