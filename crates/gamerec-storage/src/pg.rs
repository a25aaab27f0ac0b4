use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use gamerec_core::{CorpusGame, GameId, GameRecord, ReviewRecord};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};

use crate::{GameStore, StoreCounts, StoreError, GAMES, REVIEWS};

pub const DEFAULT_BATCH_ROWS: usize = 1_000;

/// Bind parameters Postgres accepts in one statement.
pub const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// Rows per `INSERT` for a table of `columns` columns, capped so the statement stays
/// within [`MAX_BIND_PARAMS`].
pub fn rows_per_statement(requested: usize, columns: usize) -> usize {
    requested.clamp(1, (MAX_BIND_PARAMS / columns.max(1)).max(1))
}

/// Postgres-backed store. Upserts use native `INSERT … ON CONFLICT … DO UPDATE`.
#[derive(Debug, Clone)]
pub struct PgGameStore {
    pool: PgPool,
    batch_rows: usize,
}

impl PgGameStore {
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|err| StoreError::from_sqlx("connect", err))?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            batch_rows: DEFAULT_BATCH_ROWS,
        }
    }

    /// Rows per `INSERT` statement, further capped per table by the bind limit; one call
    /// still commits as a single transaction.
    pub fn with_batch_rows(mut self, batch_rows: usize) -> Self {
        self.batch_rows = batch_rows.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl GameStore for PgGameStore {
    async fn upsert_games(&self, games: &[GameRecord]) -> Result<u64, StoreError> {
        if games.is_empty() {
            return Ok(0);
        }
        let sql_err = |err: sqlx::Error| StoreError::from_sqlx(GAMES.table, err);
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        let mut written = 0u64;
        for chunk in games.chunks(rows_per_statement(self.batch_rows, GAMES.columns.len())) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(GAMES.insert_prefix());
            qb.push_values(chunk, |mut b, g| {
                b.push_bind(g.game_id.0)
                    .push_bind(g.title.clone())
                    .push_bind(g.release_year)
                    .push_bind(g.price)
                    .push_bind(g.tags.iter().cloned().collect::<Vec<String>>())
                    .push_bind(g.positive_ratio)
                    .push_bind(g.review_count)
                    .push_bind(g.owners_estimate)
                    .push_bind(g.description.clone());
            });
            qb.push(GAMES.conflict_clause());
            let result = qb
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .map_err(sql_err)?;
            written += result.rows_affected();
            debug!(rows = chunk.len(), "upserted games chunk");
        }
        tx.commit().await.map_err(sql_err)?;
        Ok(written)
    }

    async fn upsert_reviews(&self, reviews: &[ReviewRecord]) -> Result<u64, StoreError> {
        if reviews.is_empty() {
            return Ok(0);
        }
        let sql_err = |err: sqlx::Error| StoreError::from_sqlx(REVIEWS.table, err);
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        let mut written = 0u64;
        for chunk in reviews.chunks(rows_per_statement(self.batch_rows, REVIEWS.columns.len())) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(REVIEWS.insert_prefix());
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.review_key.clone())
                    .push_bind(r.game_id.0)
                    .push_bind(r.language.clone())
                    .push_bind(r.recommended)
                    .push_bind(r.body.clone())
                    .push_bind(r.created_at);
            });
            qb.push(REVIEWS.conflict_clause());
            let result = qb
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .map_err(sql_err)?;
            written += result.rows_affected();
            debug!(rows = chunk.len(), "upserted reviews chunk");
        }
        tx.commit().await.map_err(sql_err)?;
        Ok(written)
    }

    async fn existing_game_ids(&self, ids: &[GameId]) -> Result<HashSet<GameId>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let raw = ids.iter().map(|id| id.0).collect::<Vec<i64>>();
        let rows = sqlx::query("SELECT game_id FROM games WHERE game_id = ANY($1)")
            .bind(raw)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::from_sqlx(GAMES.table, err))?;
        rows.iter()
            .map(|row| {
                row.try_get::<i64, _>("game_id")
                    .map(GameId)
                    .map_err(|err| StoreError::from_sqlx(GAMES.table, err))
            })
            .collect()
    }

    async fn load_corpus(&self) -> Result<Vec<CorpusGame>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT g.game_id, g.title, g.release_year, g.price, g.tags, g.positive_ratio,
                   g.review_count, g.owners_estimate, g.description,
                   COALESCE(
                       array_agg(DISTINCT r.language) FILTER (WHERE r.language IS NOT NULL),
                       '{}'
                   ) AS review_languages
            FROM games g
            LEFT JOIN reviews r ON r.game_id = g.game_id
            GROUP BY g.game_id
            ORDER BY g.game_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::from_sqlx(GAMES.table, err))?;

        let decode = |row: &sqlx::postgres::PgRow| -> Result<CorpusGame, sqlx::Error> {
            Ok(CorpusGame {
                game: GameRecord {
                    game_id: GameId(row.try_get("game_id")?),
                    title: row.try_get("title")?,
                    release_year: row.try_get("release_year")?,
                    price: row.try_get("price")?,
                    tags: row.try_get::<Vec<String>, _>("tags")?.into_iter().collect(),
                    positive_ratio: row.try_get("positive_ratio")?,
                    review_count: row.try_get("review_count")?,
                    owners_estimate: row.try_get("owners_estimate")?,
                    description: row.try_get("description")?,
                },
                review_languages: row
                    .try_get::<Vec<String>, _>("review_languages")?
                    .into_iter()
                    .collect(),
            })
        };
        rows.iter()
            .map(|row| decode(row).map_err(|err| StoreError::from_sqlx(GAMES.table, err)))
            .collect()
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM games) AS games, (SELECT COUNT(*) FROM reviews) AS reviews",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|err| StoreError::from_sqlx(GAMES.table, err))?;
        let games: i64 = row
            .try_get("games")
            .map_err(|err| StoreError::from_sqlx(GAMES.table, err))?;
        let reviews: i64 = row
            .try_get("reviews")
            .map_err(|err| StoreError::from_sqlx(REVIEWS.table, err))?;
        Ok(StoreCounts {
            games: games.max(0) as u64,
            reviews: reviews.max(0) as u64,
        })
    }
}
