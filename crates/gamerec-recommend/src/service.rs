//! Ranking, filtering and justification on top of the cached similarity model.

use std::collections::HashSet;
use std::sync::Arc;

use gamerec_core::{CorpusGame, GameId, Recommendation, RecommendationFilters};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::cache::ModelCache;
use crate::explain::{default_rules, justify, JustificationRule, Reference};
use crate::similarity::{rank_order, BuildError, Neighbor, SimilarityModel, SparseVector};

#[derive(Debug, Error)]
pub enum RecommendError {
    #[error("game {0} not found")]
    NotFound(GameId),
    #[error("no game titled {0:?}")]
    TitleNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Build(#[from] BuildError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendConfig {
    pub similarity_weight: f64,
    pub quality_weight: f64,
    /// Pseudo-count in `review_count / (review_count + review_prior)`.
    pub review_prior: f64,
    pub title_match_threshold: f64,
    pub rules: Vec<JustificationRule>,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            similarity_weight: 0.75,
            quality_weight: 0.25,
            review_prior: 50.0,
            title_match_threshold: 0.85,
            rules: default_rules(),
        }
    }
}

impl RecommendConfig {
    /// Quality term: positivity shrunk toward zero for titles with few reviews.
    pub fn quality(&self, game: &CorpusGame) -> f64 {
        let reviews = game.game.review_count.max(0) as f64;
        let confidence = if reviews + self.review_prior > 0.0 {
            reviews / (reviews + self.review_prior)
        } else {
            0.0
        };
        game.game.positive_ratio * confidence
    }

    pub fn score(&self, similarity: f64, game: &CorpusGame) -> f64 {
        self.similarity_weight * similarity + self.quality_weight * self.quality(game)
    }
}

fn check_request(k: usize, filters: &RecommendationFilters) -> Result<(), RecommendError> {
    if k == 0 {
        return Err(RecommendError::InvalidArgument("k must be at least 1".into()));
    }
    if let Some(range) = &filters.price_range {
        if !range.is_well_formed() {
            return Err(RecommendError::InvalidArgument(format!(
                "price range {}..{} is inverted or not finite",
                range.min, range.max
            )));
        }
    }
    Ok(())
}

fn passes(game: &CorpusGame, filters: &RecommendationFilters) -> bool {
    let tags_ok = filters.tags.is_empty() || filters.tags.iter().any(|t| game.game.has_tag(t));
    let price_ok = filters
        .price_range
        .map_or(true, |range| range.contains(game.game.price));
    let language_ok = filters.language.as_deref().map_or(true, |language| {
        game.review_languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(language.trim()))
    });
    tags_ok && price_ok && language_ok
}

/// Scores every candidate in `model` against `query` and returns the best `k`. Pure
/// function of its inputs.
pub fn rank(
    model: &SimilarityModel,
    config: &RecommendConfig,
    query: &SparseVector,
    reference: &Reference,
    exclude: &HashSet<GameId>,
    k: usize,
    filters: &RecommendationFilters,
) -> Vec<Recommendation> {
    let similarities = model.similarities(query);
    let mut scored = model
        .games()
        .iter()
        .zip(similarities)
        .filter(|(game, _)| !exclude.contains(&game.game.game_id) && passes(game, filters))
        .map(|(game, similarity)| (config.score(similarity, game), similarity, game))
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| rank_order((a.0, a.2), (b.0, b.2)));
    scored
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(idx, (score, similarity, game))| Recommendation {
            game_id: game.game.game_id,
            title: game.game.title.clone(),
            rank: idx + 1,
            score,
            similarity,
            justifications: justify(&config.rules, reference, &game.game, similarity),
        })
        .collect()
}

/// Read-only query surface; safe to share between concurrent callers.
#[derive(Clone)]
pub struct RecommendationService {
    cache: Arc<ModelCache>,
    config: RecommendConfig,
}

impl RecommendationService {
    pub fn new(cache: Arc<ModelCache>, config: RecommendConfig) -> Self {
        Self { cache, config }
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn config(&self) -> &RecommendConfig {
        &self.config
    }

    /// At most `k` games similar to `seed`, best first; never includes the seed. An empty
    /// list means nothing passed the filters.
    #[instrument(skip(self, filters))]
    pub async fn recommend(
        &self,
        seed: GameId,
        k: usize,
        filters: &RecommendationFilters,
    ) -> Result<Vec<Recommendation>, RecommendError> {
        check_request(k, filters)?;
        let model = self.cache.get_or_build().await?;
        let game = model.game(seed).ok_or(RecommendError::NotFound(seed))?;
        let query = model.vector(seed).ok_or(RecommendError::NotFound(seed))?;
        let exclude = HashSet::from([seed]);
        let out = rank(
            &model,
            &self.config,
            query,
            &Reference::of_game(&game.game),
            &exclude,
            k,
            filters,
        );
        debug!(returned = out.len(), "recommendations ranked");
        Ok(out)
    }

    /// Recommendations for someone who liked every game in `liked`, using the centroid of
    /// their vectors. Liked games are never returned.
    pub async fn recommend_for_profile(
        &self,
        liked: &[GameId],
        k: usize,
        filters: &RecommendationFilters,
    ) -> Result<Vec<Recommendation>, RecommendError> {
        check_request(k, filters)?;
        if liked.is_empty() {
            return Err(RecommendError::InvalidArgument(
                "profile needs at least one liked game".into(),
            ));
        }
        let model = self.cache.get_or_build().await?;
        let mut games = Vec::with_capacity(liked.len());
        let mut vectors = Vec::with_capacity(liked.len());
        for id in liked {
            let game = model.game(*id).ok_or(RecommendError::NotFound(*id))?;
            let vector = model.vector(*id).ok_or(RecommendError::NotFound(*id))?;
            games.push(&game.game);
            vectors.push(vector);
        }
        let query = SparseVector::centroid(vectors);
        let exclude = liked.iter().copied().collect::<HashSet<_>>();
        Ok(rank(
            &model,
            &self.config,
            &query,
            &Reference::of_profile(games),
            &exclude,
            k,
            filters,
        ))
    }

    /// Precomputed nearest neighbors of `seed`, no filters or quality term applied.
    pub async fn similar_games(&self, seed: GameId, k: usize) -> Result<Vec<Neighbor>, RecommendError> {
        check_request(k, &RecommendationFilters::default())?;
        let model = self.cache.get_or_build().await?;
        let neighbors = model.neighbors(seed).ok_or(RecommendError::NotFound(seed))?;
        Ok(neighbors.iter().take(k).copied().collect())
    }

    /// Exact case-insensitive title match first, then the closest Jaro–Winkler match above
    /// the configured threshold. Ties go to the lower identifier.
    pub async fn resolve_title(&self, title: &str) -> Result<GameId, RecommendError> {
        let model = self.cache.get_or_build().await?;
        resolve_title_in(&model, title, self.config.title_match_threshold)
            .ok_or_else(|| RecommendError::TitleNotFound(title.to_string()))
    }
}

pub fn resolve_title_in(model: &SimilarityModel, title: &str, threshold: f64) -> Option<GameId> {
    let wanted = title.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    if let Some(game) = model
        .games()
        .iter()
        .find(|g| g.game.title.trim().to_lowercase() == wanted)
    {
        return Some(game.game.game_id);
    }
    let mut best: Option<(f64, GameId)> = None;
    for game in model.games() {
        let score = jaro_winkler(&wanted, &game.game.title.trim().to_lowercase());
        if score > threshold && best.map_or(true, |(top, _)| score > top) {
            best = Some((score, game.game.game_id));
        }
    }
    best.map(|(_, id)| id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CorpusSource;
    use crate::similarity::tests::game;
    use crate::similarity::SimilarityParams;
    use async_trait::async_trait;
    use gamerec_core::PriceRange;

    struct Fixed(Vec<CorpusGame>);

    #[async_trait]
    impl CorpusSource for Fixed {
        async fn load_corpus(&self) -> Result<Vec<CorpusGame>, BuildError> {
            Ok(self.0.clone())
        }
    }

    fn service(games: Vec<CorpusGame>) -> RecommendationService {
        let cache = ModelCache::new(Arc::new(Fixed(games)), SimilarityParams::default());
        RecommendationService::new(Arc::new(cache), RecommendConfig::default())
    }

    /// A and B share most tags; C shares none with A.
    fn abc() -> Vec<CorpusGame> {
        vec![
            game(1, "Alpha Tactics", &["Strategy", "Turn-Based", "Fantasy"], "Command a squad of mages", 0.9),
            game(2, "Beta Tactics", &["Strategy", "Turn-Based", "Fantasy"], "Lead mages into battle", 0.85),
            game(3, "Cozy Kart", &["Racing", "Casual"], "Drift around colourful tracks", 0.95),
        ]
    }

    #[tokio::test]
    async fn similar_game_outranks_unrelated_one() {
        let svc = service(abc());
        let recs = svc
            .recommend(GameId(1), 2, &RecommendationFilters::default())
            .await
            .expect("recommend");
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].game_id, GameId(2));
        assert_eq!(recs[0].rank, 1);
        assert!(recs[0].similarity > recs[1].similarity);
        assert_eq!(
            &recs[0].justifications[..3],
            &["shared tag: Fantasy", "shared tag: Strategy", "shared tag: Turn-Based"]
        );
        assert!(recs.iter().all(|r| r.game_id != GameId(1)));
        assert!(recs.iter().all(|r| !r.justifications.is_empty()));
    }

    #[tokio::test]
    async fn shared_tag_beats_unrelated_popular_title() {
        let mut a = game(1, "A", &["RPG", "Indie"], "", 0.95);
        a.game.review_count = 500;
        let mut b = game(2, "B", &["RPG"], "", 0.80);
        b.game.review_count = 10;
        let mut c = game(3, "C", &["Shooter"], "", 0.90);
        c.game.review_count = 1000;
        let svc = service(vec![a, b, c]);

        let recs = svc
            .recommend(GameId(1), 2, &RecommendationFilters::default())
            .await
            .expect("recommend");
        assert_eq!(recs.iter().map(|r| r.game_id).collect::<Vec<_>>(), vec![GameId(2), GameId(3)]);
        assert!((recs[0].score - 0.487).abs() < 1e-3, "B scored {}", recs[0].score);
        assert!((recs[1].score - 0.214).abs() < 1e-3, "C scored {}", recs[1].score);
        assert_eq!(recs[0].justifications[0], "shared tag: RPG");
        assert!(recs[1].justifications.iter().all(|j| !j.starts_with("shared tag")));
        assert!(!recs[1].justifications.is_empty());
    }

    #[tokio::test]
    async fn results_are_deterministic() {
        let svc = service(abc());
        let filters = RecommendationFilters::default();
        let first = svc.recommend(GameId(2), 5, &filters).await.expect("first");
        let second = svc.recommend(GameId(2), 5, &filters).await.expect("second");
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn filters_narrow_candidates() {
        let svc = service(abc());
        let only_racing = RecommendationFilters {
            tags: ["racing".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let recs = svc.recommend(GameId(1), 5, &only_racing).await.expect("recommend");
        assert_eq!(recs.iter().map(|r| r.game_id).collect::<Vec<_>>(), vec![GameId(3)]);

        let nothing = RecommendationFilters {
            language: Some("klingon".into()),
            ..Default::default()
        };
        assert!(svc.recommend(GameId(1), 5, &nothing).await.expect("empty").is_empty());

        let cheap = RecommendationFilters {
            price_range: Some(PriceRange { min: 0.0, max: 5.0 }),
            ..Default::default()
        };
        assert!(svc.recommend(GameId(1), 5, &cheap).await.expect("empty").is_empty());
    }

    #[tokio::test]
    async fn bad_requests_are_distinguished_from_empty_results() {
        let svc = service(abc());
        let filters = RecommendationFilters::default();
        assert!(matches!(
            svc.recommend(GameId(99), 3, &filters).await,
            Err(RecommendError::NotFound(GameId(99)))
        ));
        assert!(matches!(
            svc.recommend(GameId(1), 0, &filters).await,
            Err(RecommendError::InvalidArgument(_))
        ));
        let inverted = RecommendationFilters {
            price_range: Some(PriceRange { min: 10.0, max: 1.0 }),
            ..Default::default()
        };
        assert!(matches!(
            svc.recommend(GameId(1), 3, &inverted).await,
            Err(RecommendError::InvalidArgument(_))
        ));
    }

    #[test]
    fn few_reviews_are_down_weighted() {
        let config = RecommendConfig::default();
        let mut popular = game(1, "Popular", &[], "", 0.9);
        popular.game.review_count = 5_000;
        let mut obscure = game(2, "Obscure", &[], "", 1.0);
        obscure.game.review_count = 2;
        assert!(config.score(0.5, &popular) > config.score(0.5, &obscure));
    }

    #[tokio::test]
    async fn profile_excludes_liked_games() {
        let svc = service(abc());
        let recs = svc
            .recommend_for_profile(&[GameId(1), GameId(3)], 5, &RecommendationFilters::default())
            .await
            .expect("profile");
        assert_eq!(recs.iter().map(|r| r.game_id).collect::<Vec<_>>(), vec![GameId(2)]);
        assert!(matches!(
            svc.recommend_for_profile(&[], 5, &RecommendationFilters::default()).await,
            Err(RecommendError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn titles_resolve_exactly_then_fuzzily() {
        let svc = service(abc());
        assert_eq!(svc.resolve_title("beta tactics").await.expect("exact"), GameId(2));
        assert_eq!(svc.resolve_title("Cozy Kartt").await.expect("fuzzy"), GameId(3));
        assert!(matches!(
            svc.resolve_title("Zzzz").await,
            Err(RecommendError::TitleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn neighbors_come_from_the_precomputed_lists() {
        let svc = service(abc());
        let neighbors = svc.similar_games(GameId(1), 5).await.expect("neighbors");
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].game_id, GameId(2));
    }
}
