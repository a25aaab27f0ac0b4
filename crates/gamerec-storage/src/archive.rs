//! Write-once archive of validation reports: one JSON file per run, named by run id, plus an
//! append-only `index.jsonl` with one line per archived run.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gamerec_core::ValidationReport;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

const INDEX_FILE: &str = "index.jsonl";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding archived report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("run {run_id} is already archived with different content")]
    Conflict { run_id: Uuid },
    #[error("run {run_id} is not in the archive")]
    NotFound { run_id: Uuid },
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One line of the archive index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub sha256: String,
    pub rows_examined: u64,
    pub rows_rejected: u64,
}

#[derive(Debug, Clone)]
pub struct ArchivedReport {
    pub run_id: Uuid,
    pub path: PathBuf,
    pub sha256: String,
    /// This exact report was archived by an earlier call.
    pub already_present: bool,
}

#[derive(Debug, Clone)]
pub struct ReportArchive {
    root: PathBuf,
}

impl ReportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.root.join(format!("{run_id}.json"))
    }

    fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Archives `report` under its run id. Re-archiving the identical report is a no-op;
    /// a different report for an archived run is refused.
    pub async fn archive(&self, report: &ValidationReport) -> Result<ArchivedReport, ArchiveError> {
        let run_id = report.run_id();
        let bytes = serde_json::to_vec_pretty(report)?;
        let sha256 = Self::digest(&bytes);
        let path = self.path_for(run_id);
        fs::create_dir_all(&self.root)
            .await
            .map_err(io_at(&self.root))?;

        match fs::read(&path).await {
            Ok(existing) if Self::digest(&existing) == sha256 => {
                debug!(%run_id, "report already archived");
                return Ok(ArchivedReport {
                    run_id,
                    path,
                    sha256,
                    already_present: true,
                });
            }
            Ok(_) => return Err(ArchiveError::Conflict { run_id }),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_at(&path)(err)),
        }

        // Readers never see a half-written report.
        let staging = self.root.join(format!(".{run_id}.json.partial"));
        fs::write(&staging, &bytes).await.map_err(io_at(&staging))?;
        fs::rename(&staging, &path).await.map_err(io_at(&path))?;

        let entry = ArchiveEntry {
            run_id,
            created_at: report.created_at(),
            sha256: sha256.clone(),
            rows_examined: report.rows_examined(),
            rows_rejected: report.rows_rejected(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let index = self.root.join(INDEX_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .await
            .map_err(io_at(&index))?;
        file.write_all(&line).await.map_err(io_at(&index))?;
        file.flush().await.map_err(io_at(&index))?;

        info!(%run_id, rejected = entry.rows_rejected, "validation report archived");
        Ok(ArchivedReport {
            run_id,
            path,
            sha256,
            already_present: false,
        })
    }

    pub async fn load(&self, run_id: Uuid) -> Result<ValidationReport, ArchiveError> {
        let path = self.path_for(run_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound { run_id })
            }
            Err(err) => return Err(io_at(&path)(err)),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Archived runs, oldest first.
    pub async fn entries(&self) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let index = self.root.join(INDEX_FILE);
        let text = match fs::read_to_string(&index).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_at(&index)(err)),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ArchiveError::from))
            .collect()
    }
}
