//! Parquet snapshots of what a run accepted and rejected, plus a hashed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Float64Array, Int32Array, Int64Array, RecordBatch, StringArray, UInt32Array, UInt64Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use gamerec_core::{GameRecord, Rejection};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn games_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("game_id", DataType::Int64, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("release_year", DataType::Int32, true),
        ArrowField::new("price", DataType::Float64, false),
        ArrowField::new("positive_ratio", DataType::Float64, false),
        ArrowField::new("review_count", DataType::Int64, false),
        ArrowField::new("owners_estimate", DataType::Int64, false),
        ArrowField::new("description", DataType::Utf8, false),
    ]))
}

fn game_tags_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("game_id", DataType::Int64, false),
        ArrowField::new("tag", DataType::Utf8, false),
    ]))
}

fn games_batch(schema: Arc<Schema>, games: &[GameRecord]) -> Result<RecordBatch> {
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                games.iter().map(|g| g.game_id.0).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                games.iter().map(|g| g.title.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(Int32Array::from(
                games.iter().map(|g| g.release_year).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                games.iter().map(|g| g.price).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                games.iter().map(|g| g.positive_ratio).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                games.iter().map(|g| g.review_count).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                games.iter().map(|g| g.owners_estimate).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                games.iter().map(|g| g.description.as_str()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building games record batch")
}

fn game_tags_batch(schema: Arc<Schema>, games: &[GameRecord]) -> Result<RecordBatch> {
    let rows = games
        .iter()
        .flat_map(|g| g.tags.iter().map(move |tag| (g.game_id.0, tag.as_str())))
        .collect::<Vec<_>>();
    let ids = Int64Array::from(rows.iter().map(|(id, _)| *id).collect::<Vec<_>>());
    let tags = StringArray::from(rows.iter().map(|(_, t)| *t).collect::<Vec<_>>());
    RecordBatch::try_new(schema, vec![Arc::new(ids), Arc::new(tags)])
        .context("building game tags record batch")
}

fn open_writer(path: &Path, schema: Arc<Schema>) -> Result<ArrowWriter<File>> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    ArrowWriter::try_new(file, schema, None)
        .with_context(|| format!("opening parquet writer {}", path.display()))
}

/// Appends loaded games to `snapshots/games.parquet` and `snapshots/game_tags.parquet` batch
/// by batch, so a run never has to hold every record it loaded.
pub struct GameSnapshotWriter {
    reports_dir: PathBuf,
    games_path: PathBuf,
    tags_path: PathBuf,
    games: ArrowWriter<File>,
    tags: ArrowWriter<File>,
    rows: u64,
}

impl GameSnapshotWriter {
    pub fn create(reports_dir: &Path) -> Result<Self> {
        let snapshot_dir = reports_dir.join("snapshots");
        std::fs::create_dir_all(&snapshot_dir)
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;
        let games_path = snapshot_dir.join("games.parquet");
        let tags_path = snapshot_dir.join("game_tags.parquet");
        Ok(Self {
            reports_dir: reports_dir.to_path_buf(),
            games: open_writer(&games_path, games_schema())?,
            tags: open_writer(&tags_path, game_tags_schema())?,
            games_path,
            tags_path,
            rows: 0,
        })
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn append(&mut self, games: &[GameRecord]) -> Result<()> {
        if games.is_empty() {
            return Ok(());
        }
        self.games
            .write(&games_batch(games_schema(), games)?)
            .with_context(|| format!("writing record batch {}", self.games_path.display()))?;
        self.tags
            .write(&game_tags_batch(game_tags_schema(), games)?)
            .with_context(|| format!("writing record batch {}", self.tags_path.display()))?;
        self.rows += games.len() as u64;
        Ok(())
    }

    /// Closes the game files, writes the rejections file and the manifest, and returns the
    /// manifest path.
    pub fn finish(self, rejections: &[Rejection]) -> Result<PathBuf> {
        self.games
            .close()
            .with_context(|| format!("closing parquet writer {}", self.games_path.display()))?;
        self.tags
            .close()
            .with_context(|| format!("closing parquet writer {}", self.tags_path.display()))?;

        let snapshot_dir = self.reports_dir.join("snapshots");
        let rejections_path = snapshot_dir.join("rejections.parquet");
        write_rejections_parquet(&rejections_path, rejections)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("games", &self.reports_dir, &self.games_path)?,
                manifest_entry("game_tags", &self.reports_dir, &self.tags_path)?,
                manifest_entry("rejections", &self.reports_dir, &rejections_path)?,
            ],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        std::fs::write(&manifest_path, bytes)
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

pub fn write_rejections_parquet(path: &Path, rejections: &[Rejection]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("dataset", DataType::Utf8, false),
        ArrowField::new("source_index", DataType::UInt32, false),
        ArrowField::new("row_index", DataType::UInt64, false),
        ArrowField::new("rule", DataType::Utf8, false),
        ArrowField::new("column", DataType::Utf8, false),
        ArrowField::new("detail", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                rejections.iter().map(|r| r.dataset.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                rejections.iter().map(|r| r.ordinal.source).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                rejections.iter().map(|r| r.ordinal.row).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rejections.iter().map(|r| r.rule.tag()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rejections.iter().map(|r| r.column.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rejections.iter().map(|r| r.detail.as_str()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building rejections record batch")?;
    write_parquet(path, batch)
}

pub fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
