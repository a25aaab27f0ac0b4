//! Relational store for games and reviews, the upsert loader, and the report archive.

use std::collections::HashSet;

use async_trait::async_trait;
use gamerec_core::{CorpusGame, GameId, GameRecord, ReviewRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod archive;
pub mod loader;
pub mod memory;
pub mod pg;

pub use archive::{ArchiveEntry, ArchiveError, ArchivedReport, ReportArchive};
pub use loader::{LoadOutcome, UpsertLoader, UpsertRetry};
pub use memory::MemoryGameStore;
pub use pg::PgGameStore;

pub const CRATE_NAME: &str = "gamerec-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violated on {table}: {detail}")]
    Constraint { table: String, detail: String },
    #[error("batch does not fit table {table}: {detail}")]
    BatchShape { table: String, detail: String },
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Unavailable(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }

    fn from_sqlx(table: &str, err: sqlx::Error) -> Self {
        if classify_sqlx_error(&err) == RetryDisposition::Retryable {
            return StoreError::Unavailable(err.to_string());
        }
        match &err {
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                StoreError::Constraint {
                    table: table.to_string(),
                    detail: db.message().to_string(),
                }
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Connection-level trouble is worth retrying; anything the database itself rejected is not,
/// except the SQLSTATE classes that signal a dropped connection or a serialization conflict.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if code.starts_with("08") || code == "40001" || code == "57P01" => {
                RetryDisposition::Retryable
            }
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

/// Target table layout: natural key plus the full column list, in bind order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDescriptor {
    pub table: &'static str,
    pub key_columns: &'static [&'static str],
    pub columns: &'static [&'static str],
}

pub const GAMES: TableDescriptor = TableDescriptor {
    table: "games",
    key_columns: &["game_id"],
    columns: &[
        "game_id",
        "title",
        "release_year",
        "price",
        "tags",
        "positive_ratio",
        "review_count",
        "owners_estimate",
        "description",
    ],
};

pub const REVIEWS: TableDescriptor = TableDescriptor {
    table: "reviews",
    key_columns: &["review_key"],
    columns: &[
        "review_key",
        "game_id",
        "language",
        "recommended",
        "body",
        "created_at",
    ],
};

impl TableDescriptor {
    pub fn update_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .copied()
            .filter(|c| !self.key_columns.contains(c))
    }

    pub fn insert_prefix(&self) -> String {
        format!("INSERT INTO {} ({}) ", self.table, self.columns.join(", "))
    }

    /// `ON CONFLICT` clause overwriting every non-key column, skipping rows whose values
    /// would not change so an identical re-run writes nothing.
    pub fn conflict_clause(&self) -> String {
        let updates = self.update_columns().collect::<Vec<_>>();
        let set = updates
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let current = updates
            .iter()
            .map(|c| format!("{}.{c}", self.table))
            .collect::<Vec<_>>()
            .join(", ");
        let incoming = updates
            .iter()
            .map(|c| format!("EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            " ON CONFLICT ({}) DO UPDATE SET {set} WHERE ({current}) IS DISTINCT FROM ({incoming})",
            self.key_columns.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub games: u64,
    pub reviews: u64,
}

/// Durable home of the catalog. Each upsert call is one transaction: it either applies
/// every row or none, and returns the number of rows inserted or changed.
#[async_trait]
pub trait GameStore: Send + Sync {
    async fn upsert_games(&self, games: &[GameRecord]) -> Result<u64, StoreError>;

    async fn upsert_reviews(&self, reviews: &[ReviewRecord]) -> Result<u64, StoreError>;

    /// Subset of `ids` already present in the store.
    async fn existing_game_ids(&self, ids: &[GameId]) -> Result<HashSet<GameId>, StoreError>;

    /// Every stored game with the set of languages it has reviews in, ordered by id.
    async fn load_corpus(&self) -> Result<Vec<CorpusGame>, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_clause_updates_only_non_key_columns() {
        let clause = REVIEWS.conflict_clause();
        assert!(clause.starts_with(" ON CONFLICT (review_key) DO UPDATE SET game_id = EXCLUDED.game_id"));
        assert!(!clause.contains("review_key = EXCLUDED.review_key"));
        assert!(clause.contains("IS DISTINCT FROM (EXCLUDED.game_id"));
        assert_eq!(
            GAMES.insert_prefix(),
            "INSERT INTO games (game_id, title, release_year, price, tags, positive_ratio, review_count, owners_estimate, description) "
        );
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(StoreError::Unavailable("connection reset".into()).is_retryable());
        assert!(!StoreError::Constraint {
            table: "reviews".into(),
            detail: "fk".into()
        }
        .is_retryable());
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::PoolTimedOut),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::RowNotFound),
            RetryDisposition::NonRetryable
        );
    }
}
