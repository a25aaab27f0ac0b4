//! ETL orchestration: extract, transform, validate and load one catalog + review drop,
//! producing exactly one validation report and one run summary.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gamerec_core::{ColumnBatch, GameId, Rejection, RuleKind, ValidationReport, Value};
use gamerec_sources::{open_sources, SourceChunks, SourceError, SourceSet, DEFAULT_CHUNK_ROWS};
use gamerec_storage::{
    GameStore, MemoryGameStore, PgGameStore, ReportArchive, StoreError, UpsertLoader,
    UpsertRetry,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub mod pipeline;
pub mod snapshot;
pub mod transform;
pub mod validate;

pub use pipeline::{DatasetPipeline, PipelineSpec};
pub use snapshot::GameSnapshotWriter;
pub use transform::{TransformError, TransformStage, TransformStats, TransformStep};
pub use validate::{DatasetSchema, Partition, SchemaError, SchemaValidator, ValidationReportBuilder};

pub const CRATE_NAME: &str = "gamerec-etl";

const VIOLATION_EXAMPLES: usize = 10;

#[derive(Debug, Clone)]
pub struct EtlConfig {
    /// In-memory store when unset.
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub chunk_rows: usize,
    pub parallelism: usize,
    pub run_timeout: Option<Duration>,
    pub dedup_order_column: Option<String>,
    pub load_batch_rows: usize,
    pub load_retry: UpsertRetry,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            workspace_root: PathBuf::from("."),
            chunk_rows: DEFAULT_CHUNK_ROWS,
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            run_timeout: None,
            dedup_order_column: None,
            load_batch_rows: gamerec_storage::pg::DEFAULT_BATCH_ROWS,
            load_retry: UpsertRetry::default(),
        }
    }
}

impl EtlConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            workspace_root: std::env::var("GAMEREC_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            chunk_rows: env_parse("GAMEREC_CHUNK_ROWS").unwrap_or(defaults.chunk_rows),
            parallelism: env_parse("GAMEREC_PARALLELISM").unwrap_or(defaults.parallelism),
            run_timeout: env_parse::<u64>("GAMEREC_RUN_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            dedup_order_column: std::env::var("GAMEREC_DEDUP_ORDER_COLUMN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            load_batch_rows: env_parse("GAMEREC_LOAD_BATCH_ROWS")
                .unwrap_or(defaults.load_batch_rows),
            load_retry: UpsertRetry {
                retries: env_parse("GAMEREC_LOAD_RETRIES").unwrap_or(defaults.load_retry.retries),
                ..defaults.load_retry
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Declared in run order; `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Extracting,
    Transforming,
    Validating,
    Loading,
    Completed,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Extracting => "extracting",
            RunStage::Transforming => "transforming",
            RunStage::Validating => "validating",
            RunStage::Loading => "loading",
            RunStage::Completed => "completed",
            RunStage::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("reading sources: {0}")]
    Source(#[from] SourceError),
    #[error("transforming: {0}")]
    Transform(#[from] TransformError),
    #[error("schema contract: {0}")]
    Schema(#[from] SchemaError),
    #[error("loading: {0}")]
    Store(#[from] StoreError),
    #[error("run timed out while {0}")]
    Timeout(RunStage),
    #[error("worker task failed: {0}")]
    Join(String),
}

impl EtlError {
    /// Stage the failure belongs to, when the error itself tells.
    pub fn stage(&self) -> Option<RunStage> {
        match self {
            EtlError::Source(_) => Some(RunStage::Extracting),
            EtlError::Transform(_) => Some(RunStage::Transforming),
            EtlError::Schema(_) => Some(RunStage::Validating),
            EtlError::Store(_) => Some(RunStage::Loading),
            EtlError::Timeout(stage) => Some(*stage),
            EtlError::Join(_) => None,
        }
    }

    /// Whether re-running the same input may succeed.
    pub fn retryable(&self) -> bool {
        match self {
            EtlError::Source(SourceError::Io { .. }) => true,
            EtlError::Transform(TransformError::Source(SourceError::Io { .. })) => true,
            EtlError::Store(err) => err.is_retryable(),
            EtlError::Timeout(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: RunStage,
    pub cause: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    /// Raw rows read from the sources.
    pub processed: u64,
    /// Rows leaving the transform stage.
    pub transformed: u64,
    pub filtered: u64,
    pub duplicates: u64,
    pub rejected: u64,
    /// Rows handed to the store.
    pub upserted: u64,
    /// Rows the store actually inserted or changed.
    pub written: u64,
}

impl DatasetSummary {
    fn record_transform(&mut self, stats: &TransformStats) {
        self.processed = stats.rows_in;
        self.transformed = stats.rows_out;
        self.filtered = stats.rows_filtered;
        self.duplicates = stats.duplicates_dropped;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_stage: RunStage,
    pub failure: Option<RunFailure>,
    pub catalog: DatasetSummary,
    pub reviews: DatasetSummary,
    pub rows_processed: u64,
    pub rows_rejected: u64,
    pub rows_upserted: u64,
    pub rule_counts: BTreeMap<String, u64>,
    pub violation_examples: Vec<Rejection>,
    pub reports_dir: Option<String>,
    pub archived_report: Option<String>,
    pub parquet_manifest: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub report: ValidationReport,
    /// Every stage the run entered, in order, ending in `Completed` or `Failed`.
    pub transitions: Vec<RunStage>,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.summary.final_stage == RunStage::Completed
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        self.summary.failure.as_ref()
    }
}

/// What the transform worker hands to the loading side.
enum Feed {
    /// Sent once per dataset, before its first batch is validated.
    Validating,
    Batch {
        accepted: ColumnBatch,
        report: ValidationReportBuilder,
    },
}

/// Validated batches allowed in flight between the worker and the loader.
const FEED_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy)]
enum Dataset {
    Catalog,
    Reviews,
}

struct RunState {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    deadline: Option<Instant>,
    transitions: Vec<RunStage>,
    /// Stage of the work in flight. Drops back to `Transforming` when reviews start, while
    /// `transitions` only ever moves forward.
    active: RunStage,
    report: ValidationReportBuilder,
    catalog: DatasetSummary,
    reviews: DatasetSummary,
    loaded_games: HashSet<GameId>,
    snapshot: Option<GameSnapshotWriter>,
}

impl RunState {
    fn enter(&mut self, stage: RunStage) -> Result<(), EtlError> {
        self.active = stage;
        let advanced = match self.transitions.last() {
            Some(last) => *last < stage,
            None => true,
        };
        if advanced {
            self.transitions.push(stage);
            info!(stage = %stage, "entering stage");
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(EtlError::Timeout(stage)),
            _ => Ok(()),
        }
    }

    fn summary_mut(&mut self, dataset: Dataset) -> &mut DatasetSummary {
        match dataset {
            Dataset::Catalog => &mut self.catalog,
            Dataset::Reviews => &mut self.reviews,
        }
    }
}

/// Transforms and validates one dataset on the blocking pool. Each batch is validated into
/// its own report and sent to `feed`; the worker stops at the next batch once the
/// receiving side is gone.
fn transform_and_validate(
    stage: TransformStage,
    mut validator: SchemaValidator,
    chunks: SourceChunks,
    run_id: Uuid,
    created_at: DateTime<Utc>,
    feed: mpsc::Sender<Feed>,
) -> Result<TransformStats, EtlError> {
    let abandoned = || TransformError::Sink("run abandoned by the orchestrator".to_string());
    let mut contract = None;
    let mut announced = false;
    let result = stage.run(chunks, |batch| {
        if !announced {
            feed.blocking_send(Feed::Validating).map_err(|_| abandoned())?;
            announced = true;
        }
        let mut report = ValidationReportBuilder::new(run_id, created_at);
        let partition = validator.validate(&batch, &mut report).map_err(|err| {
            let cause = TransformError::Sink(err.to_string());
            contract = Some(err);
            cause
        })?;
        drop(batch);
        feed.blocking_send(Feed::Batch {
            accepted: partition.accepted,
            report,
        })
        .map_err(|_| abandoned())
    });
    match (result, contract) {
        (_, Some(err)) => Err(EtlError::Schema(err)),
        (Ok(stats), None) => Ok(stats),
        (Err(err), None) => Err(err.into()),
    }
}

fn review_game_ids(batch: &ColumnBatch) -> impl Iterator<Item = GameId> + '_ {
    (0..batch.num_rows()).filter_map(|row| {
        batch
            .value("game_id", row)
            .and_then(Value::as_i64)
            .map(GameId)
    })
}

/// Splits out reviews whose game is unknown to both the run and the store.
fn drop_orphans(
    dataset: &str,
    batch: &ColumnBatch,
    known: impl Fn(GameId) -> bool,
) -> (ColumnBatch, Vec<Rejection>) {
    let mut keep = Vec::with_capacity(batch.num_rows());
    let mut orphans = Vec::new();
    for row in 0..batch.num_rows() {
        let game_id = batch
            .value("game_id", row)
            .and_then(Value::as_i64)
            .map(GameId);
        match game_id {
            Some(game_id) if !known(game_id) => {
                keep.push(false);
                orphans.push(Rejection {
                    dataset: dataset.to_string(),
                    ordinal: batch.ordinals()[row],
                    rule: RuleKind::OrphanedReview,
                    column: "game_id".to_string(),
                    detail: format!("game {game_id} is not in the catalog"),
                });
            }
            _ => keep.push(true),
        }
    }
    (batch.filter(&keep), orphans)
}

/// Drives one ETL run through `Extracting → Transforming → Validating → Loading →
/// Completed`, or `Failed` from whichever stage broke. Runs against the same store must
/// be serialized by the caller.
pub struct EtlOrchestrator {
    config: EtlConfig,
    pipeline: PipelineSpec,
    store: Arc<dyn GameStore>,
    reports_root: Option<PathBuf>,
}

impl EtlOrchestrator {
    pub fn new(config: EtlConfig, pipeline: PipelineSpec, store: Arc<dyn GameStore>) -> Self {
        let pipeline = pipeline.with_dedup_order(config.dedup_order_column.as_deref());
        Self {
            config,
            pipeline,
            store,
            reports_root: None,
        }
    }

    /// Writes `reports/<run_id>/` and the report archive under `root` after each run.
    pub fn with_reports(mut self, root: impl Into<PathBuf>) -> Self {
        self.reports_root = Some(root.into());
        self
    }

    pub fn store(&self) -> &Arc<dyn GameStore> {
        &self.store
    }

    /// Runs once over `sources`. Never returns an error: failures are reported in the
    /// outcome with the stage they happened in.
    pub async fn run(&self, sources: &SourceSet) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("etl_run", %run_id);
        async {
            let mut report = ValidationReportBuilder::new(run_id, started_at);
            report.register(&self.pipeline.catalog.schema.dataset);
            report.register(&self.pipeline.reviews.schema.dataset);
            let mut state = RunState {
                run_id,
                started_at,
                deadline: self.config.run_timeout.map(|timeout| Instant::now() + timeout),
                transitions: Vec::new(),
                active: RunStage::Extracting,
                report,
                catalog: DatasetSummary::default(),
                reviews: DatasetSummary::default(),
                loaded_games: HashSet::new(),
                snapshot: self.open_snapshot(run_id),
            };

            let result = match state.deadline {
                Some(deadline) => {
                    let attempt =
                        tokio::time::timeout_at(deadline, self.execute(sources, &mut state)).await;
                    attempt.unwrap_or_else(|_| Err(EtlError::Timeout(state.active)))
                }
                None => self.execute(sources, &mut state).await,
            };
            let failure = match result {
                Ok(()) => {
                    state.transitions.push(RunStage::Completed);
                    None
                }
                Err(err) => {
                    let stage = err.stage().unwrap_or(state.active);
                    warn!(stage = %stage, error = %err, retryable = err.retryable(), "run failed");
                    state.transitions.push(RunStage::Failed);
                    Some(RunFailure {
                        stage,
                        cause: err.to_string(),
                        retryable: err.retryable(),
                    })
                }
            };

            let snapshot = state.snapshot.take();
            let report = std::mem::replace(
                &mut state.report,
                ValidationReportBuilder::new(run_id, started_at),
            )
            .finish();
            let mut summary = self.summarize(&state, failure, &report);
            info!(
                final_stage = %summary.final_stage,
                processed = summary.rows_processed,
                rejected = summary.rows_rejected,
                upserted = summary.rows_upserted,
                "run finished"
            );

            if let Some(root) = &self.reports_root {
                if let Err(err) = self
                    .write_reports(root, &mut summary, &report, snapshot)
                    .await
                {
                    warn!(error = %err, "writing run reports failed");
                }
            }

            RunOutcome {
                summary,
                report,
                transitions: state.transitions,
            }
        }
        .instrument(span)
        .await
    }

    fn reports_dir(root: &Path, run_id: Uuid) -> PathBuf {
        root.join("reports").join(run_id.to_string())
    }

    fn open_snapshot(&self, run_id: Uuid) -> Option<GameSnapshotWriter> {
        let root = self.reports_root.as_deref()?;
        match GameSnapshotWriter::create(&Self::reports_dir(root, run_id)) {
            Ok(writer) => Some(writer),
            Err(err) => {
                warn!(error = %err, "games snapshot disabled");
                None
            }
        }
    }

    /// Catalog first, so reviews can be checked against this run's games as well as the
    /// store's.
    async fn execute(&self, sources: &SourceSet, state: &mut RunState) -> Result<(), EtlError> {
        state.enter(RunStage::Extracting)?;
        let catalog_chunks = open_sources(&sources.catalog, self.config.chunk_rows)?;
        let review_chunks = open_sources(&sources.reviews, self.config.chunk_rows)?;

        let loader = UpsertLoader::new(Arc::clone(&self.store)).with_retry(self.config.load_retry);
        self.stream_dataset(Dataset::Catalog, catalog_chunks, &loader, state)
            .await?;
        self.stream_dataset(Dataset::Reviews, review_chunks, &loader, state)
            .await?;

        // Empty inputs still pass through every stage.
        state.enter(RunStage::Validating)?;
        state.enter(RunStage::Loading)
    }

    /// Runs one dataset end to end: a blocking worker transforms and validates batch by
    /// batch while this task merges each batch's report and loads it. Nothing outlives
    /// the batch it came from except the loaded game ids.
    async fn stream_dataset(
        &self,
        dataset: Dataset,
        chunks: SourceChunks,
        loader: &UpsertLoader,
        state: &mut RunState,
    ) -> Result<(), EtlError> {
        let pipeline = match dataset {
            Dataset::Catalog => &self.pipeline.catalog,
            Dataset::Reviews => &self.pipeline.reviews,
        };
        state.enter(RunStage::Transforming)?;
        let validator = SchemaValidator::new(pipeline.schema.clone())?;
        let stage = TransformStage::new(
            pipeline.steps.clone(),
            self.config.parallelism,
            self.config.chunk_rows,
        );

        let (feed, mut batches) = mpsc::channel(FEED_DEPTH);
        let (run_id, started_at) = (state.run_id, state.started_at);
        let span = Span::current();
        let worker = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            transform_and_validate(stage, validator, chunks, run_id, started_at, feed)
        });

        while let Some(item) = batches.recv().await {
            match item {
                Feed::Validating => state.enter(RunStage::Validating)?,
                Feed::Batch { accepted, report } => {
                    state.report.merge(report);
                    if accepted.is_empty() {
                        continue;
                    }
                    state.enter(RunStage::Loading)?;
                    match dataset {
                        Dataset::Catalog => self.load_games(loader, &accepted, state).await?,
                        Dataset::Reviews => self.load_reviews(loader, &accepted, state).await?,
                    }
                }
            }
        }

        let stats = worker
            .await
            .map_err(|err| EtlError::Join(err.to_string()))??;
        debug!(?dataset, ?stats, "dataset finished");
        state.summary_mut(dataset).record_transform(&stats);
        Ok(())
    }

    async fn load_games(
        &self,
        loader: &UpsertLoader,
        batch: &ColumnBatch,
        state: &mut RunState,
    ) -> Result<(), EtlError> {
        let (outcome, records) = loader.load_games(batch).await?;
        state.catalog.upserted += outcome.submitted;
        state.catalog.written += outcome.written;
        state.loaded_games.extend(records.iter().map(|g| g.game_id));
        if let Some(writer) = state.snapshot.as_mut() {
            if let Err(err) = writer.append(&records) {
                warn!(error = %err, "games snapshot disabled");
                state.snapshot = None;
            }
        }
        Ok(())
    }

    async fn load_reviews(
        &self,
        loader: &UpsertLoader,
        batch: &ColumnBatch,
        state: &mut RunState,
    ) -> Result<(), EtlError> {
        let unseen = review_game_ids(batch)
            .filter(|id| !state.loaded_games.contains(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let stored = if unseen.is_empty() {
            HashSet::new()
        } else {
            self.store.existing_game_ids(&unseen).await?
        };

        let dataset = &self.pipeline.reviews.schema.dataset;
        let (batch, orphans) = drop_orphans(dataset, batch, |id| {
            state.loaded_games.contains(&id) || stored.contains(&id)
        });
        if !orphans.is_empty() {
            warn!(orphans = orphans.len(), "dropping reviews of unknown games");
            state.report.record_rejections(orphans);
        }
        if batch.is_empty() {
            return Ok(());
        }
        let (outcome, _) = loader.load_reviews(&batch).await?;
        state.reviews.upserted += outcome.submitted;
        state.reviews.written += outcome.written;
        Ok(())
    }

    fn summarize(
        &self,
        state: &RunState,
        failure: Option<RunFailure>,
        report: &ValidationReport,
    ) -> RunSummary {
        let rejected_in = |dataset: &str| {
            report
                .datasets()
                .get(dataset)
                .map(|c| c.rejected)
                .unwrap_or(0)
        };
        let mut catalog = state.catalog;
        catalog.rejected = rejected_in(&self.pipeline.catalog.schema.dataset);
        let mut reviews = state.reviews;
        reviews.rejected = rejected_in(&self.pipeline.reviews.schema.dataset);

        RunSummary {
            run_id: state.run_id,
            started_at: state.started_at,
            finished_at: Utc::now(),
            final_stage: if failure.is_some() {
                RunStage::Failed
            } else {
                RunStage::Completed
            },
            failure,
            catalog,
            reviews,
            rows_processed: catalog.processed + reviews.processed,
            rows_rejected: report.rows_rejected(),
            rows_upserted: catalog.upserted + reviews.upserted,
            rule_counts: report
                .rule_counts()
                .iter()
                .map(|(rule, count)| (rule.tag().to_string(), *count))
                .collect(),
            violation_examples: report.examples(VIOLATION_EXAMPLES).to_vec(),
            reports_dir: None,
            archived_report: None,
            parquet_manifest: None,
        }
    }

    async fn write_reports(
        &self,
        root: &Path,
        summary: &mut RunSummary,
        report: &ValidationReport,
        snapshot: Option<GameSnapshotWriter>,
    ) -> Result<()> {
        let reports_dir = Self::reports_dir(root, summary.run_id);
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        summary.reports_dir = Some(reports_dir.display().to_string());

        let archive = ReportArchive::new(root.join("reports").join("archive"));
        let archived = archive.archive(report).await?;
        summary.archived_report = Some(archived.path.display().to_string());

        if let Some(writer) = snapshot {
            let manifest = writer.finish(report.rejections())?;
            summary.parquet_manifest = Some(manifest.display().to_string());
        }

        let report_json =
            serde_json::to_vec_pretty(report).context("serializing validation report")?;
        fs::write(reports_dir.join("validation_report.json"), report_json)
            .await
            .context("writing validation_report.json")?;

        fs::write(reports_dir.join("run_brief.md"), render_brief(summary))
            .await
            .context("writing run_brief.md")?;

        let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), summary_json)
            .await
            .context("writing run_summary.json")?;
        Ok(())
    }
}

fn dataset_line(name: &str, d: &DatasetSummary) -> String {
    format!(
        "- {name}: processed {}, filtered {}, duplicates {}, rejected {}, upserted {} ({} changed)",
        d.processed, d.filtered, d.duplicates, d.rejected, d.upserted, d.written
    )
}

pub fn render_brief(summary: &RunSummary) -> String {
    let status = match &summary.failure {
        None => "completed".to_string(),
        Some(f) => format!(
            "failed while {} ({}): {}",
            f.stage,
            if f.retryable { "retryable" } else { "fatal" },
            f.cause
        ),
    };
    let rules = if summary.rule_counts.is_empty() {
        "- none".to_string()
    } else {
        summary
            .rule_counts
            .iter()
            .map(|(rule, count)| format!("- {rule}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let examples = summary
        .violation_examples
        .iter()
        .map(|r| {
            format!(
                "- {} source {} row {}: {} on `{}` ({})",
                r.dataset, r.ordinal.source, r.ordinal.row, r.rule, r.column, r.detail
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# GameRec ETL Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Status: {}\n\n## Datasets\n{}\n{}\n\n## Rejections by Rule\n{}\n\n## Examples\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        status,
        dataset_line("catalog", &summary.catalog),
        dataset_line("reviews", &summary.reviews),
        rules,
        if examples.is_empty() { "- none".to_string() } else { examples },
    )
}

/// Connects (Postgres when `DATABASE_URL` is set, in-memory otherwise), discovers the CSV
/// files in `input_dir` and runs the pipeline once.
pub async fn run_etl_from_env(input_dir: &Path) -> Result<RunOutcome> {
    let config = EtlConfig::from_env();
    let pipeline = PipelineSpec::from_workspace_root(&config.workspace_root)?;
    let store: Arc<dyn GameStore> = match &config.database_url {
        Some(url) => {
            let parallelism = u32::try_from(config.parallelism).unwrap_or(u32::MAX);
            let store = PgGameStore::connect(url, parallelism.max(2))
                .await
                .context("connecting to DATABASE_URL")?
                .with_batch_rows(config.load_batch_rows);
            store.migrate().await.context("running migrations")?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; loading into an in-memory store");
            Arc::new(MemoryGameStore::new())
        }
    };
    let sources = SourceSet::discover(input_dir)
        .with_context(|| format!("discovering sources in {}", input_dir.display()))?;
    if sources.is_empty() {
        warn!(dir = %input_dir.display(), "no catalog or review files found");
    }
    let root = config.workspace_root.clone();
    Ok(EtlOrchestrator::new(config, pipeline, store)
        .with_reports(root)
        .run(&sources)
        .await)
}
