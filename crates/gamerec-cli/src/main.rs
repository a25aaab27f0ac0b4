use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use gamerec_api::ServiceConfig;
use gamerec_core::{normalize_tag, GameId, PriceRange, RecommendationFilters};
use gamerec_etl::{render_brief, EtlConfig, EtlOrchestrator, PipelineSpec, RunOutcome};
use gamerec_recommend::service_for_store;
use gamerec_sources::SourceSet;
use gamerec_storage::{GameStore, PgGameStore, ReportArchive};
use tracing::{info, warn};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "gamerec-cli")]
#[command(about = "Game catalog ETL and recommendation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ETL pipeline once over the CSV files in a directory.
    Etl {
        #[arg(long, default_value = "fixtures")]
        input: PathBuf,
    },
    /// Apply database migrations (requires DATABASE_URL).
    Migrate,
    /// List archived validation reports, or print one run's report as JSON.
    Reports {
        #[arg(long)]
        run_id: Option<Uuid>,
    },
    /// Print recommendations for one game.
    Recommend(RecommendArgs),
    /// Serve the HTTP API.
    Serve {
        /// Run the ETL over this directory first; needed when no database is configured.
        #[arg(long)]
        load: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct RecommendArgs {
    #[arg(long, conflicts_with = "title", required_unless_present = "title")]
    game_id: Option<i64>,
    #[arg(long)]
    title: Option<String>,
    #[arg(short, long, default_value_t = 10)]
    k: usize,
    /// Repeatable; a candidate must carry at least one.
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    min_price: Option<f64>,
    #[arg(long)]
    max_price: Option<f64>,
    #[arg(long)]
    language: Option<String>,
    /// Run the ETL over this directory first; needed when no database is configured.
    #[arg(long)]
    load: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

impl RecommendArgs {
    fn filters(&self) -> RecommendationFilters {
        let price_range = match (self.min_price, self.max_price) {
            (None, None) => None,
            (min, max) => Some(PriceRange {
                min: min.unwrap_or(0.0),
                max: max.unwrap_or(f64::MAX),
            }),
        };
        RecommendationFilters {
            tags: self.tags.iter().filter_map(|t| normalize_tag(t)).collect(),
            price_range,
            language: self.language.as_ref().map(|l| l.trim().to_lowercase()),
        }
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn load_into(store: Arc<dyn GameStore>, input: &Path) -> Result<RunOutcome> {
    let config = EtlConfig::from_env();
    let pipeline = PipelineSpec::from_workspace_root(&config.workspace_root)?;
    let sources = SourceSet::discover(input)
        .with_context(|| format!("discovering sources in {}", input.display()))?;
    let root = config.workspace_root.clone();
    let outcome = EtlOrchestrator::new(config, pipeline, store)
        .with_reports(root)
        .run(&sources)
        .await;
    if let Some(failure) = outcome.failure() {
        bail!("etl failed while {}: {}", failure.stage, failure.cause);
    }
    info!(
        run_id = %outcome.summary.run_id,
        upserted = outcome.summary.rows_upserted,
        "etl run loaded"
    );
    Ok(outcome)
}

async fn prepared_store(config: &ServiceConfig, load: Option<&Path>) -> Result<Arc<dyn GameStore>> {
    let store = gamerec_api::connect_store(config).await?;
    match load {
        Some(dir) => {
            load_into(Arc::clone(&store), dir).await?;
        }
        None if config.database_url.is_none() => {
            warn!("no DATABASE_URL and no --load directory; the catalog is empty");
        }
        None => {}
    }
    Ok(store)
}

async fn recommend(args: RecommendArgs) -> Result<()> {
    let config = ServiceConfig::from_env();
    let store = prepared_store(&config, args.load.as_deref()).await?;
    let service = service_for_store(store, config.recommend.clone());
    let seed = match (&args.title, args.game_id) {
        (Some(title), _) => service.resolve_title(title).await?,
        (None, Some(id)) => GameId(id),
        (None, None) => bail!("either --game-id or --title is required"),
    };
    let recs = service.recommend(seed, args.k, &args.filters()).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&recs)?);
        return Ok(());
    }
    if recs.is_empty() {
        println!("no games matched the filters for seed {seed}");
    }
    for rec in recs {
        println!(
            "{:>2}. {} ({}) score={:.3} similarity={:.3}",
            rec.rank, rec.title, rec.game_id, rec.score, rec.similarity
        );
        for reason in rec.justifications {
            println!("      - {reason}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Etl {
        input: PathBuf::from("fixtures"),
    }) {
        Commands::Etl { input } => {
            let outcome = gamerec_etl::run_etl_from_env(&input).await?;
            let summary = &outcome.summary;
            println!(
                "etl {}: run_id={} processed={} rejected={} upserted={} reports={}",
                summary.final_stage,
                summary.run_id,
                summary.rows_processed,
                summary.rows_rejected,
                summary.rows_upserted,
                summary.reports_dir.as_deref().unwrap_or("n/a")
            );
            if let Some(failure) = outcome.failure() {
                eprintln!("{}", render_brief(summary));
                bail!("etl failed while {}: {}", failure.stage, failure.cause);
            }
        }
        Commands::Migrate => {
            let config = ServiceConfig::from_env();
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgGameStore::connect(url, 1)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Reports { run_id } => {
            let root = EtlConfig::from_env().workspace_root;
            let archive = ReportArchive::new(root.join("reports").join("archive"));
            match run_id {
                Some(run_id) => {
                    let report = archive.load(run_id).await?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                None => {
                    for entry in archive.entries().await? {
                        println!(
                            "{} {} examined={} rejected={} sha256={}",
                            entry.created_at.to_rfc3339(),
                            entry.run_id,
                            entry.rows_examined,
                            entry.rows_rejected,
                            entry.sha256
                        );
                    }
                }
            }
        }
        Commands::Recommend(args) => recommend(args).await?,
        Commands::Serve { load } => {
            let config = ServiceConfig::from_env();
            let store = prepared_store(&config, load.as_deref()).await?;
            gamerec_api::serve(&config, store).await?;
        }
    }

    Ok(())
}
