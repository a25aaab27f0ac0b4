use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use gamerec_core::{CorpusGame, GameId, GameRecord, ReviewRecord};
use tokio::sync::Mutex;

use crate::{GameStore, StoreCounts, StoreError, GAMES, REVIEWS};

#[derive(Debug, Default)]
struct Tables {
    games: BTreeMap<GameId, GameRecord>,
    reviews: BTreeMap<String, ReviewRecord>,
}

/// In-process store with the same upsert contract as Postgres, written as an explicit
/// insert-if-absent-else-update. Used by tests and by the CLI when no database is set.
#[derive(Debug, Default)]
pub struct MemoryGameStore {
    tables: Mutex<Tables>,
    outage: AtomicBool,
}

impl MemoryGameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails with [`StoreError::Unavailable`].
    pub fn inject_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store outage injected".into()));
        }
        Ok(())
    }

    pub async fn games(&self) -> Vec<GameRecord> {
        self.tables.lock().await.games.values().cloned().collect()
    }

    pub async fn reviews(&self) -> Vec<ReviewRecord> {
        self.tables.lock().await.reviews.values().cloned().collect()
    }
}

fn upsert<K: Ord + Clone, V: Clone + PartialEq>(
    table: &mut BTreeMap<K, V>,
    key: &K,
    row: &V,
) -> bool {
    match table.get_mut(key) {
        None => {
            table.insert(key.clone(), row.clone());
            true
        }
        Some(existing) if existing != row => {
            *existing = row.clone();
            true
        }
        Some(_) => false,
    }
}

#[async_trait]
impl GameStore for MemoryGameStore {
    async fn upsert_games(&self, games: &[GameRecord]) -> Result<u64, StoreError> {
        self.check_up()?;
        // Checks mirror the table's CHECK constraints; the whole batch is rejected before
        // anything is applied.
        for game in games {
            if game.game_id.0 < 0
                || !(game.price >= 0.0)
                || !(0.0..=1.0).contains(&game.positive_ratio)
                || game.review_count < 0
                || game.owners_estimate < 0
            {
                return Err(StoreError::Constraint {
                    table: GAMES.table.into(),
                    detail: format!("check constraint failed for game {}", game.game_id),
                });
            }
        }
        let mut tables = self.tables.lock().await;
        let mut written = 0;
        for game in games {
            if upsert(&mut tables.games, &game.game_id, game) {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn upsert_reviews(&self, reviews: &[ReviewRecord]) -> Result<u64, StoreError> {
        self.check_up()?;
        let mut tables = self.tables.lock().await;
        if let Some(orphan) = reviews
            .iter()
            .find(|r| !tables.games.contains_key(&r.game_id))
        {
            return Err(StoreError::Constraint {
                table: REVIEWS.table.into(),
                detail: format!(
                    "review {} references missing game {}",
                    orphan.review_key, orphan.game_id
                ),
            });
        }
        let mut written = 0;
        for review in reviews {
            if upsert(&mut tables.reviews, &review.review_key, review) {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn existing_game_ids(&self, ids: &[GameId]) -> Result<HashSet<GameId>, StoreError> {
        self.check_up()?;
        let tables = self.tables.lock().await;
        Ok(ids
            .iter()
            .filter(|id| tables.games.contains_key(id))
            .copied()
            .collect())
    }

    async fn load_corpus(&self) -> Result<Vec<CorpusGame>, StoreError> {
        self.check_up()?;
        let tables = self.tables.lock().await;
        let mut languages: BTreeMap<GameId, BTreeSet<String>> = BTreeMap::new();
        for review in tables.reviews.values() {
            languages
                .entry(review.game_id)
                .or_default()
                .insert(review.language.clone());
        }
        Ok(tables
            .games
            .values()
            .map(|game| CorpusGame {
                game: game.clone(),
                review_languages: languages.remove(&game.game_id).unwrap_or_default(),
            })
            .collect())
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        self.check_up()?;
        let tables = self.tables.lock().await;
        Ok(StoreCounts {
            games: tables.games.len() as u64,
            reviews: tables.reviews.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn game(id: i64, title: &str) -> GameRecord {
        GameRecord {
            game_id: GameId(id),
            title: title.into(),
            release_year: Some(2020),
            price: 9.99,
            tags: ["RPG".to_string()].into_iter().collect(),
            positive_ratio: 0.8,
            review_count: 100,
            owners_estimate: 10_000,
            description: String::new(),
        }
    }

    fn review(key: &str, game_id: i64) -> ReviewRecord {
        ReviewRecord {
            review_key: key.into(),
            game_id: GameId(game_id),
            language: "english".into(),
            recommended: true,
            body: "fun".into(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_then_skips_identical() {
        let store = MemoryGameStore::new();
        assert_eq!(store.upsert_games(&[game(1, "A")]).await.unwrap(), 1);
        assert_eq!(store.upsert_games(&[game(1, "A")]).await.unwrap(), 0);
        assert_eq!(store.upsert_games(&[game(1, "A2")]).await.unwrap(), 1);
        let games = store.games().await;
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].title, "A2");
    }

    #[tokio::test]
    async fn orphan_review_rejects_whole_batch() {
        let store = MemoryGameStore::new();
        store.upsert_games(&[game(1, "A")]).await.unwrap();
        let err = store
            .upsert_reviews(&[review("r1", 1), review("r2", 99)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { .. }));
        assert!(store.reviews().await.is_empty());
    }

    #[tokio::test]
    async fn corpus_carries_review_languages() {
        let store = MemoryGameStore::new();
        store.upsert_games(&[game(1, "A"), game(2, "B")]).await.unwrap();
        let mut schinese = review("r2", 1);
        schinese.language = "schinese".into();
        store
            .upsert_reviews(&[review("r1", 1), schinese])
            .await
            .unwrap();

        let corpus = store.load_corpus().await.unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(
            corpus[0].review_languages.iter().cloned().collect::<Vec<_>>(),
            vec!["english".to_string(), "schinese".to_string()]
        );
        assert!(corpus[1].review_languages.is_empty());
        assert_eq!(store.counts().await.unwrap(), StoreCounts { games: 2, reviews: 2 });
    }

    #[tokio::test]
    async fn outage_is_retryable_and_leaves_tables_untouched() {
        let store = MemoryGameStore::new();
        store.inject_outage(true);
        let err = store.upsert_games(&[game(1, "A")]).await.unwrap_err();
        assert!(err.is_retryable());
        store.inject_outage(false);
        assert!(store.games().await.is_empty());
    }
}
