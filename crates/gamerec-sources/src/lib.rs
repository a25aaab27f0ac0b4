//! Raw tabular source readers: bounded-size CSV chunks feeding the transform stage.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::{ByteRecord, ReaderBuilder};
use gamerec_core::{BatchError, ColumnBatch, RowOrdinal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "gamerec-sources";

pub const DEFAULT_CHUNK_ROWS: usize = 50_000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading source {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing csv {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// A bounded slice of one raw source. Cells are untyped text.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub source_index: u32,
    /// Data-row number (0-based, header excluded) of the first row in the chunk.
    pub first_row: u64,
    pub headers: Arc<Vec<String>>,
    pub rows: Vec<Vec<String>>,
}

impl RawChunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_batch(self) -> Result<ColumnBatch, BatchError> {
        let ordinals = (0..self.rows.len() as u64)
            .map(|offset| RowOrdinal {
                source: self.source_index,
                row: self.first_row + offset,
            })
            .collect();
        ColumnBatch::from_text_rows(&self.headers, self.rows, ordinals)
    }
}

/// Streams one CSV source as chunks of at most `chunk_rows` rows. Never holds more than
/// one chunk of the file in memory.
pub struct CsvChunkReader {
    label: String,
    source_index: u32,
    reader: csv::Reader<Box<dyn Read + Send>>,
    headers: Arc<Vec<String>>,
    chunk_rows: usize,
    next_row: u64,
    record: ByteRecord,
    done: bool,
}

impl std::fmt::Debug for CsvChunkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvChunkReader")
            .field("label", &self.label)
            .field("source_index", &self.source_index)
            .field("chunk_rows", &self.chunk_rows)
            .field("next_row", &self.next_row)
            .finish()
    }
}

impl CsvChunkReader {
    pub fn open(path: &Path, source_index: u32, chunk_rows: usize) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_reader(
            path.display().to_string(),
            source_index,
            Box::new(BufReader::with_capacity(8 << 20, file)),
            chunk_rows,
        )
    }

    pub fn from_reader(
        label: impl Into<String>,
        source_index: u32,
        input: Box<dyn Read + Send>,
        chunk_rows: usize,
    ) -> Result<Self, SourceError> {
        let label = label.into();
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::None)
            .from_reader(input);
        let headers = reader
            .byte_headers()
            .map_err(|source| SourceError::Csv {
                path: label.clone(),
                source,
            })?
            .iter()
            .map(|h| {
                String::from_utf8_lossy(h)
                    .trim_start_matches('\u{feff}')
                    .trim()
                    .to_string()
            })
            .collect::<Vec<_>>();
        let done = headers.iter().all(|h| h.is_empty());

        Ok(Self {
            label,
            source_index,
            reader,
            headers: Arc::new(headers),
            chunk_rows: chunk_rows.max(1),
            next_row: 0,
            record: ByteRecord::new(),
            done,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    fn read_chunk(&mut self) -> Result<Option<RawChunk>, SourceError> {
        let first_row = self.next_row;
        let mut rows = Vec::with_capacity(self.chunk_rows.min(4096));
        while rows.len() < self.chunk_rows {
            let more = self
                .reader
                .read_byte_record(&mut self.record)
                .map_err(|source| SourceError::Csv {
                    path: self.label.clone(),
                    source,
                })?;
            if !more {
                self.done = true;
                break;
            }
            rows.push(
                self.record
                    .iter()
                    .map(|cell| String::from_utf8_lossy(cell).into_owned())
                    .collect::<Vec<_>>(),
            );
            self.next_row += 1;
        }
        if rows.is_empty() {
            return Ok(None);
        }
        debug!(
            source = %self.label,
            first_row,
            rows = rows.len(),
            "read raw chunk"
        );
        Ok(Some(RawChunk {
            source_index: self.source_index,
            first_row,
            headers: Arc::clone(&self.headers),
            rows,
        }))
    }
}

impl Iterator for CsvChunkReader {
    type Item = Result<RawChunk, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Several sources read one after another; the source index is the position in the list.
#[derive(Debug, Default)]
pub struct SourceChunks {
    readers: VecDeque<CsvChunkReader>,
}

impl SourceChunks {
    pub fn from_readers(readers: Vec<CsvChunkReader>) -> Self {
        Self {
            readers: readers.into(),
        }
    }
}

impl Iterator for SourceChunks {
    type Item = Result<RawChunk, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let reader = self.readers.front_mut()?;
            match reader.next() {
                Some(item) => return Some(item),
                None => {
                    self.readers.pop_front();
                }
            }
        }
    }
}

/// Opens every path up front so a missing file fails before any row is read.
pub fn open_sources(paths: &[PathBuf], chunk_rows: usize) -> Result<SourceChunks, SourceError> {
    let readers = paths
        .iter()
        .enumerate()
        .map(|(idx, path)| CsvChunkReader::open(path, idx as u32, chunk_rows))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SourceChunks::from_readers(readers))
}

/// Catalog and review files for one ETL run, in the order they should be ingested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSet {
    pub catalog: Vec<PathBuf>,
    pub reviews: Vec<PathBuf>,
}

impl SourceSet {
    /// Classifies `*.csv` files in `dir` by name: anything mentioning "review" is a review
    /// source, "game" or "catalog" a catalog source. Others are ignored.
    pub fn discover(dir: &Path) -> Result<Self, SourceError> {
        let entries = fs::read_dir(dir).map_err(|source| SourceError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SourceError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let mut set = SourceSet::default();
        for path in files {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
                continue;
            };
            if !name.ends_with(".csv") {
                continue;
            }
            if name.contains("review") {
                set.reviews.push(path);
            } else if name.contains("game") || name.contains("catalog") {
                set.catalog.push(path);
            }
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty() && self.reviews.is_empty()
    }
}
