use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gamerec_core::{ColumnBatch, GameId, GameRecord, ReviewRecord, Value};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{GameStore, StoreError, TableDescriptor, GAMES, REVIEWS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOutcome {
    /// Rows handed to the store.
    pub submitted: u64,
    /// Rows the store inserted or changed.
    pub written: u64,
}

/// How often an upsert transaction that failed with a retryable [`StoreError`] is tried
/// again. The wait doubles from `first_delay` and is capped at `max_delay`. Retrying is
/// safe because an upsert either commits whole or not at all, and re-applying it is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertRetry {
    /// Attempts after the first.
    pub retries: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for UpsertRetry {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl UpsertRetry {
    /// Fail on the first error.
    pub const NEVER: UpsertRetry = UpsertRetry {
        retries: 0,
        first_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };

    /// Wait before retry number `retry` (0-based).
    pub fn wait_before(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.first_delay.checked_mul(factor))
            .map_or(self.max_delay, |wait| wait.min(self.max_delay))
    }

    async fn upsert<F, Fut>(
        &self,
        table: &TableDescriptor,
        rows: usize,
        mut attempt: F,
    ) -> Result<u64, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<u64, StoreError>>,
    {
        let mut retry = 0;
        loop {
            match attempt().await {
                Ok(written) => return Ok(written),
                Err(err) if err.is_retryable() && retry < self.retries => {
                    let wait = self.wait_before(retry);
                    retry += 1;
                    warn!(
                        table = table.table,
                        rows,
                        retry,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "upsert failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Turns validated column batches into row records and upserts them, one transaction per
/// batch, retrying retryable failures per [`UpsertRetry`].
#[derive(Clone)]
pub struct UpsertLoader {
    store: Arc<dyn GameStore>,
    retry: UpsertRetry,
}

impl UpsertLoader {
    pub fn new(store: Arc<dyn GameStore>) -> Self {
        Self {
            store,
            retry: UpsertRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: UpsertRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn GameStore> {
        &self.store
    }

    pub async fn load_games(
        &self,
        batch: &ColumnBatch,
    ) -> Result<(LoadOutcome, Vec<GameRecord>), StoreError> {
        let games = games_from_batch(batch)?;
        let (store, rows) = (&self.store, games.as_slice());
        let written = self
            .retry
            .upsert(&GAMES, rows.len(), move || store.upsert_games(rows))
            .await?;
        info!(rows = games.len(), written, "loaded games batch");
        Ok((
            LoadOutcome {
                submitted: games.len() as u64,
                written,
            },
            games,
        ))
    }

    pub async fn load_reviews(
        &self,
        batch: &ColumnBatch,
    ) -> Result<(LoadOutcome, Vec<ReviewRecord>), StoreError> {
        let reviews = reviews_from_batch(batch)?;
        let (store, rows) = (&self.store, reviews.as_slice());
        let written = self
            .retry
            .upsert(&REVIEWS, rows.len(), move || store.upsert_reviews(rows))
            .await?;
        info!(rows = reviews.len(), written, "loaded reviews batch");
        Ok((
            LoadOutcome {
                submitted: reviews.len() as u64,
                written,
            },
            reviews,
        ))
    }
}

static NULL: Value = Value::Null;

struct Cells<'a> {
    table: &'static TableDescriptor,
    batch: &'a ColumnBatch,
    row: usize,
}

impl<'a> Cells<'a> {
    fn get(&self, column: &str) -> &'a Value {
        self.batch.value(column, self.row).unwrap_or(&NULL)
    }

    fn shape(&self, column: &str, want: &str) -> StoreError {
        StoreError::BatchShape {
            table: self.table.table.to_string(),
            detail: format!(
                "row {} column {column}: expected {want}, found {:?}",
                self.row,
                self.get(column)
            ),
        }
    }

    fn int(&self, column: &str) -> Result<i64, StoreError> {
        self.get(column).as_i64().ok_or_else(|| self.shape(column, "integer"))
    }

    fn int_or(&self, column: &str, default: i64) -> Result<i64, StoreError> {
        match self.get(column) {
            Value::Null => Ok(default),
            _ => self.int(column),
        }
    }

    fn float(&self, column: &str) -> Result<f64, StoreError> {
        self.get(column).as_f64().ok_or_else(|| self.shape(column, "number"))
    }

    fn text(&self, column: &str) -> Result<String, StoreError> {
        self.get(column)
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| self.shape(column, "text"))
    }

    fn text_or_empty(&self, column: &str) -> Result<String, StoreError> {
        match self.get(column) {
            Value::Null => Ok(String::new()),
            _ => self.text(column),
        }
    }
}

fn check_layout(table: &TableDescriptor, batch: &ColumnBatch) -> Result<(), StoreError> {
    let missing = table
        .columns
        .iter()
        .filter(|c| batch.column(c).is_none())
        .copied()
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StoreError::BatchShape {
            table: table.table.to_string(),
            detail: format!("missing columns {}", missing.join(", ")),
        })
    }
}

fn duplicate_key(table: &TableDescriptor, key: impl std::fmt::Display) -> StoreError {
    StoreError::BatchShape {
        table: table.table.to_string(),
        detail: format!("key {key} appears more than once in one batch"),
    }
}

pub fn games_from_batch(batch: &ColumnBatch) -> Result<Vec<GameRecord>, StoreError> {
    check_layout(&GAMES, batch)?;
    let mut seen = HashSet::with_capacity(batch.num_rows());
    let mut out = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let cells = Cells {
            table: &GAMES,
            batch,
            row,
        };
        let game_id = GameId(cells.int("game_id")?);
        if !seen.insert(game_id) {
            return Err(duplicate_key(&GAMES, game_id));
        }
        let release_year = match cells.get("release_year") {
            Value::Null => None,
            _ => Some(
                i32::try_from(cells.int("release_year")?)
                    .map_err(|_| cells.shape("release_year", "32-bit year"))?,
            ),
        };
        let tags = match cells.get("tags") {
            Value::Null => Default::default(),
            Value::Tags(tags) => tags.clone(),
            _ => return Err(cells.shape("tags", "tag set")),
        };
        out.push(GameRecord {
            game_id,
            title: cells.text("title")?,
            release_year,
            price: cells.float("price")?,
            tags,
            positive_ratio: cells.float("positive_ratio")?,
            review_count: cells.int("review_count")?,
            owners_estimate: cells.int_or("owners_estimate", 0)?,
            description: cells.text_or_empty("description")?,
        });
    }
    Ok(out)
}

pub fn reviews_from_batch(batch: &ColumnBatch) -> Result<Vec<ReviewRecord>, StoreError> {
    check_layout(&REVIEWS, batch)?;
    let mut seen = HashSet::with_capacity(batch.num_rows());
    let mut out = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let cells = Cells {
            table: &REVIEWS,
            batch,
            row,
        };
        let review_key = cells.text("review_key")?;
        if !seen.insert(review_key.clone()) {
            return Err(duplicate_key(&REVIEWS, &review_key));
        }
        out.push(ReviewRecord {
            review_key,
            game_id: GameId(cells.int("game_id")?),
            language: cells.text("language")?,
            recommended: cells
                .get("recommended")
                .as_bool()
                .ok_or_else(|| cells.shape("recommended", "bool"))?,
            body: cells.text_or_empty("body")?,
            created_at: cells
                .get("created_at")
                .as_timestamp()
                .ok_or_else(|| cells.shape("created_at", "timestamp"))?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryGameStore;
    use gamerec_core::{Column, ColumnType, RowOrdinal};
    use std::time::Duration;

    fn games_batch(ids: &[i64], prices: &[f64]) -> ColumnBatch {
        let n = ids.len();
        let ordinals = (0..n as u64).map(|row| RowOrdinal { source: 0, row }).collect();
        let text = |s: &str| vec![Value::Text(s.into()); n];
        ColumnBatch::new(
            vec![
                Column::new("game_id", ColumnType::Int, ids.iter().map(|i| Value::Int(*i)).collect()),
                Column::new("title", ColumnType::Text, text("Game")),
                Column::new("release_year", ColumnType::Int, vec![Value::Null; n]),
                Column::new("price", ColumnType::Float, prices.iter().map(|p| Value::Float(*p)).collect()),
                Column::new("tags", ColumnType::TagSet, vec![Value::Null; n]),
                Column::new("positive_ratio", ColumnType::Float, vec![Value::Float(0.5); n]),
                Column::new("review_count", ColumnType::Int, vec![Value::Int(10); n]),
                Column::new("owners_estimate", ColumnType::Int, vec![Value::Null; n]),
                Column::new("description", ColumnType::Text, vec![Value::Null; n]),
            ],
            ordinals,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn identical_batch_twice_leaves_store_unchanged() {
        let store = Arc::new(MemoryGameStore::new());
        let loader = UpsertLoader::new(store.clone());
        let batch = games_batch(&[1, 2], &[0.0, 5.0]);

        let (first, _) = loader.load_games(&batch).await.unwrap();
        let snapshot = store.games().await;
        let (second, _) = loader.load_games(&batch).await.unwrap();

        assert_eq!(first, LoadOutcome { submitted: 2, written: 2 });
        assert_eq!(second, LoadOutcome { submitted: 2, written: 0 });
        assert_eq!(store.games().await, snapshot);
    }

    #[tokio::test]
    async fn duplicate_key_in_one_batch_is_a_shape_error() {
        let loader = UpsertLoader::new(Arc::new(MemoryGameStore::new()));
        let err = loader
            .load_games(&games_batch(&[1, 1], &[1.0, 2.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BatchShape { .. }));
    }

    #[test]
    fn missing_column_is_reported() {
        let batch = games_batch(&[1], &[1.0]).select(&["game_id".to_string(), "title".to_string()]);
        let err = games_from_batch(&batch).unwrap_err();
        assert!(err.to_string().contains("missing columns release_year"));
    }

    #[tokio::test]
    async fn persistent_outage_surfaces_retryable_after_retries() {
        let store = Arc::new(MemoryGameStore::new());
        store.inject_outage(true);
        let loader = UpsertLoader::new(store).with_retry(UpsertRetry {
            retries: 2,
            first_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        });
        let err = loader
            .load_games(&games_batch(&[1], &[1.0]))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn transient_failure_is_retried_until_it_commits() {
        let store = Arc::new(MemoryGameStore::new());
        store.inject_outage(true);
        let loader = UpsertLoader::new(store.clone()).with_retry(UpsertRetry {
            retries: 5,
            first_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
        });
        let recover = {
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                store.inject_outage(false);
            }
        };
        let batch = games_batch(&[1, 2], &[1.0, 2.0]);
        let (loaded, ()) = tokio::join!(loader.load_games(&batch), recover);
        let (outcome, _) = loaded.expect("retried into success");
        assert_eq!(outcome, LoadOutcome { submitted: 2, written: 2 });
        assert_eq!(store.games().await.len(), 2);
    }

    #[test]
    fn waits_double_and_cap() {
        let retry = UpsertRetry {
            retries: 5,
            first_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        let waits = (0..4).map(|r| retry.wait_before(r).as_millis()).collect::<Vec<_>>();
        assert_eq!(waits, vec![100, 200, 350, 350]);
        assert_eq!(retry.wait_before(40), Duration::from_millis(350));
        assert_eq!(UpsertRetry::NEVER.wait_before(0), Duration::ZERO);
    }
}
