//! TF-IDF vector-space model over tags and descriptions, with an inverted index for
//! sparse cosine scoring and precomputed neighbor lists.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use gamerec_core::{CorpusGame, GameId};
use gamerec_storage::StoreError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("cannot build a similarity model from an empty corpus")]
    EmptyCorpus,
    #[error("game {0} appears more than once in the corpus")]
    DuplicateGame(GameId),
    #[error("loading corpus: {0}")]
    Source(#[from] StoreError),
    #[error("model build task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityParams {
    pub tag_weight: f64,
    pub max_features: usize,
    pub neighbors_per_game: usize,
}

impl Default for SimilarityParams {
    fn default() -> Self {
        Self {
            tag_weight: 2.0,
            max_features: 5_000,
            neighbors_per_game: 50,
        }
    }
}

const STOP_WORDS: &[&str] = &[
    "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any",
    "are", "as", "at", "be", "because", "been", "before", "being", "below", "between", "both",
    "but", "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "even",
    "every", "few", "for", "from", "further", "get", "got", "had", "has", "have", "having", "he",
    "her", "here", "hers", "herself", "him", "himself", "his", "how", "if", "in", "into", "is",
    "it", "its", "itself", "just", "like", "made", "make", "many", "me", "more", "most", "much",
    "must", "my", "myself", "new", "no", "nor", "not", "now", "of", "off", "on", "once", "one",
    "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "us", "very", "was", "we", "well", "were", "what", "when", "where",
    "which", "while", "who", "whom", "why", "will", "with", "within", "without", "would", "you",
    "your", "yours", "yourself", "yourselves",
];

/// Lowercase alphanumeric words of two or more characters, minus stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|w| STOP_WORDS.binary_search(&w.as_str()).is_err())
        .collect()
}

pub fn tag_token(tag: &str) -> String {
    format!("tag:{}", tag.trim().to_lowercase())
}

/// Sparse vector with strictly increasing indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    entries: Vec<(u32, f64)>,
}

impl SparseVector {
    /// Builds from unsorted pairs; duplicate indices are summed and zeros dropped.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u32, f64)>) -> Self {
        let mut merged = BTreeMap::new();
        for (idx, value) in pairs {
            *merged.entry(idx).or_insert(0.0) += value;
        }
        Self {
            entries: merged.into_iter().filter(|(_, v)| *v != 0.0).collect(),
        }
    }

    pub fn entries(&self) -> &[(u32, f64)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn norm(&self) -> f64 {
        self.entries.iter().map(|(_, v)| v * v).sum::<f64>().sqrt()
    }

    pub fn normalized(mut self) -> Self {
        let norm = self.norm();
        if norm > 0.0 {
            for (_, v) in &mut self.entries {
                *v /= norm;
            }
        }
        self
    }

    pub fn dot(&self, other: &SparseVector) -> f64 {
        let (mut i, mut j, mut sum) = (0, 0, 0.0);
        while i < self.entries.len() && j < other.entries.len() {
            match self.entries[i].0.cmp(&other.entries[j].0) {
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
                Ordering::Equal => {
                    sum += self.entries[i].1 * other.entries[j].1;
                    i += 1;
                    j += 1;
                }
            }
        }
        sum
    }

    /// Normalized mean of several vectors.
    pub fn centroid<'a>(vectors: impl IntoIterator<Item = &'a SparseVector>) -> Self {
        let mut count = 0usize;
        let mut pairs = Vec::new();
        for v in vectors {
            count += 1;
            pairs.extend_from_slice(&v.entries);
        }
        if count == 0 {
            return Self::default();
        }
        let mut centroid = Self::from_pairs(pairs);
        for (_, v) in &mut centroid.entries {
            *v /= count as f64;
        }
        centroid.normalized()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub game_id: GameId,
    pub similarity: f64,
}

/// Immutable snapshot built from one corpus. Rebuilt wholesale, never mutated.
#[derive(Debug)]
pub struct SimilarityModel {
    built_at: DateTime<Utc>,
    fingerprint: String,
    params: SimilarityParams,
    vocabulary: HashMap<String, u32>,
    idf: Vec<f64>,
    games: Vec<CorpusGame>,
    index: HashMap<GameId, usize>,
    vectors: Vec<SparseVector>,
    postings: Vec<Vec<(usize, f64)>>,
    neighbors: Vec<Vec<Neighbor>>,
}

fn document_terms(game: &CorpusGame, tag_weight: f64) -> Vec<(String, f64)> {
    let mut terms = Vec::new();
    for tag in &game.game.tags {
        terms.push((tag_token(tag), tag_weight));
        terms.extend(tokenize(tag).into_iter().map(|t| (t, 1.0)));
    }
    terms.extend(
        tokenize(&game.game.description)
            .into_iter()
            .map(|t| (t, 1.0)),
    );
    terms
}

/// Ranking order shared by every similarity listing: similarity desc, positivity desc,
/// identifier asc.
pub(crate) fn rank_order(a: (f64, &CorpusGame), b: (f64, &CorpusGame)) -> Ordering {
    b.0.total_cmp(&a.0)
        .then_with(|| b.1.game.positive_ratio.total_cmp(&a.1.game.positive_ratio))
        .then_with(|| a.1.game.game_id.cmp(&b.1.game.game_id))
}

fn fingerprint(games: &[CorpusGame]) -> String {
    let mut hasher = Sha256::new();
    for game in games {
        match serde_json::to_vec(game) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(game.game.game_id.0.to_le_bytes()),
        }
    }
    hex::encode(hasher.finalize())
}

impl SimilarityModel {
    /// Pure function of the corpus (apart from `built_at`): the same games in any order
    /// produce the same vocabulary, vectors and neighbor lists.
    pub fn build(mut games: Vec<CorpusGame>, params: SimilarityParams) -> Result<Self, BuildError> {
        if games.is_empty() {
            return Err(BuildError::EmptyCorpus);
        }
        games.sort_by_key(|g| g.game.game_id);
        if let Some(pair) = games.windows(2).find(|w| w[0].game.game_id == w[1].game.game_id) {
            return Err(BuildError::DuplicateGame(pair[0].game.game_id));
        }
        let n = games.len();

        let documents = games
            .par_iter()
            .map(|g| document_terms(g, params.tag_weight))
            .collect::<Vec<_>>();

        let mut frequency: HashMap<&str, u64> = HashMap::new();
        let mut document_frequency: HashMap<&str, u64> = HashMap::new();
        for terms in &documents {
            let mut seen = HashSet::new();
            for (term, _) in terms {
                *frequency.entry(term.as_str()).or_insert(0) += 1;
                if seen.insert(term.as_str()) {
                    *document_frequency.entry(term.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut ranked = frequency.into_iter().collect::<Vec<_>>();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.truncate(params.max_features);
        let mut kept = ranked.into_iter().map(|(term, _)| term).collect::<Vec<_>>();
        kept.sort_unstable();

        let vocabulary = kept
            .iter()
            .enumerate()
            .map(|(idx, term)| (term.to_string(), idx as u32))
            .collect::<HashMap<_, _>>();
        let idf = kept
            .iter()
            .map(|term| {
                let df = document_frequency.get(term).copied().unwrap_or(0) as f64;
                ((1.0 + n as f64) / (1.0 + df)).ln() + 1.0
            })
            .collect::<Vec<_>>();

        let vectors = documents
            .par_iter()
            .map(|terms| {
                SparseVector::from_pairs(terms.iter().filter_map(|(term, weight)| {
                    vocabulary
                        .get(term.as_str())
                        .map(|&idx| (idx, weight * idf[idx as usize]))
                }))
                .normalized()
            })
            .collect::<Vec<_>>();

        let mut postings = vec![Vec::new(); kept.len()];
        for (doc, vector) in vectors.iter().enumerate() {
            for &(term, weight) in vector.entries() {
                postings[term as usize].push((doc, weight));
            }
        }

        let index = games
            .iter()
            .enumerate()
            .map(|(idx, g)| (g.game.game_id, idx))
            .collect();

        let mut model = Self {
            built_at: Utc::now(),
            fingerprint: fingerprint(&games),
            params,
            vocabulary,
            idf,
            games,
            index,
            vectors,
            postings,
            neighbors: Vec::new(),
        };
        model.neighbors = (0..n)
            .into_par_iter()
            .map(|doc| model.neighbors_of(doc))
            .collect();

        info!(
            games = n,
            vocabulary = model.vocabulary.len(),
            fingerprint = %model.fingerprint,
            "similarity model built"
        );
        Ok(model)
    }

    fn neighbors_of(&self, doc: usize) -> Vec<Neighbor> {
        let mut scores: HashMap<usize, f64> = HashMap::new();
        for &(term, weight) in self.vectors[doc].entries() {
            for &(other, other_weight) in &self.postings[term as usize] {
                if other != doc {
                    *scores.entry(other).or_insert(0.0) += weight * other_weight;
                }
            }
        }
        let mut ranked = scores.into_iter().collect::<Vec<_>>();
        ranked.sort_by(|a, b| rank_order((a.1, &self.games[a.0]), (b.1, &self.games[b.0])));
        ranked.truncate(self.params.neighbors_per_game);
        ranked
            .into_iter()
            .map(|(other, similarity)| Neighbor {
                game_id: self.games[other].game.game_id,
                similarity,
            })
            .collect()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// sha256 over the corpus the model was built from.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn params(&self) -> SimilarityParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn term_index(&self, term: &str) -> Option<u32> {
        self.vocabulary.get(term).copied()
    }

    pub fn idf(&self, term: &str) -> Option<f64> {
        self.term_index(term).map(|idx| self.idf[idx as usize])
    }

    /// Games ordered by identifier.
    pub fn games(&self) -> &[CorpusGame] {
        &self.games
    }

    pub fn game(&self, id: GameId) -> Option<&CorpusGame> {
        self.index.get(&id).map(|&idx| &self.games[idx])
    }

    pub fn vector(&self, id: GameId) -> Option<&SparseVector> {
        self.index.get(&id).map(|&idx| &self.vectors[idx])
    }

    /// Precomputed most-similar games, best first.
    pub fn neighbors(&self, id: GameId) -> Option<&[Neighbor]> {
        self.index.get(&id).map(|&idx| self.neighbors[idx].as_slice())
    }

    /// Cosine similarity of `query` against every game, indexed like [`Self::games`].
    pub fn similarities(&self, query: &SparseVector) -> Vec<f64> {
        let mut scores = vec![0.0; self.games.len()];
        for &(term, weight) in query.entries() {
            if let Some(posting) = self.postings.get(term as usize) {
                for &(doc, doc_weight) in posting {
                    scores[doc] += weight * doc_weight;
                }
            }
        }
        scores
    }

    /// The `k` games most similar to `query`, never including `exclude`.
    pub fn top_k(&self, query: &SparseVector, k: usize, exclude: &HashSet<GameId>) -> Vec<Neighbor> {
        let scores = self.similarities(query);
        let mut ranked = scores
            .into_iter()
            .enumerate()
            .filter(|(doc, _)| !exclude.contains(&self.games[*doc].game.game_id))
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| rank_order((a.1, &self.games[a.0]), (b.1, &self.games[b.0])));
        ranked
            .into_iter()
            .take(k)
            .map(|(doc, similarity)| Neighbor {
                game_id: self.games[doc].game.game_id,
                similarity,
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use gamerec_core::GameRecord;

    pub(crate) fn game(id: i64, title: &str, tags: &[&str], description: &str, ratio: f64) -> CorpusGame {
        CorpusGame {
            game: GameRecord {
                game_id: GameId(id),
                title: title.to_string(),
                release_year: Some(2020),
                price: 9.99,
                tags: tags.iter().map(|t| t.to_string()).collect(),
                positive_ratio: ratio,
                review_count: 500,
                owners_estimate: 50_000,
                description: description.to_string(),
            },
            review_languages: ["english".to_string()].into_iter().collect(),
        }
    }

    fn corpus() -> Vec<CorpusGame> {
        vec![
            game(1, "Space Blaster", &["Shooter", "Space"], "Fast space shooter with lasers", 0.8),
            game(2, "Star Gunner", &["Shooter", "Space"], "Arcade space shooter", 0.9),
            game(3, "Farm Days", &["Simulation", "Farming"], "Relaxing farming life", 0.95),
            game(4, "Crop Master", &["Simulation", "Farming"], "Plant crops and farming", 0.7),
        ]
    }

    #[test]
    fn tokenizer_drops_short_words_and_stop_words() {
        assert_eq!(
            tokenize("A fast, 2D shooter: the BEST of it!"),
            vec!["fast", "2d", "shooter", "best"]
        );
        assert!(STOP_WORDS.windows(2).all(|w| w[0] < w[1]), "stop words must stay sorted");
    }

    #[test]
    fn vectors_are_unit_length_and_idf_follows_smoothing() {
        let model = SimilarityModel::build(corpus(), SimilarityParams::default()).expect("build");
        for game in model.games() {
            let norm = model.vector(game.game.game_id).expect("vector").norm();
            assert!((norm - 1.0).abs() < 1e-9);
        }
        // "tag:shooter" appears in 2 of 4 documents.
        let expected = (5.0f64 / 3.0).ln() + 1.0;
        assert!((model.idf("tag:shooter").expect("term") - expected).abs() < 1e-12);
    }

    #[test]
    fn neighbors_prefer_shared_content() {
        let model = SimilarityModel::build(corpus(), SimilarityParams::default()).expect("build");
        let neighbors = model.neighbors(GameId(1)).expect("neighbors");
        assert_eq!(neighbors[0].game_id, GameId(2));
        assert!(neighbors.iter().all(|n| n.game_id != GameId(1)));

        let query = model.vector(GameId(3)).expect("vector").clone();
        let exclude = [GameId(3)].into_iter().collect();
        let top = model.top_k(&query, 2, &exclude);
        assert_eq!(top[0].game_id, GameId(4));
        assert_eq!(top.len(), 2);
    }

    #[test]
    fn ties_break_on_positivity_then_id() {
        let games = vec![
            game(1, "Seed", &["Puzzle"], "", 0.5),
            game(2, "Twin A", &["Puzzle"], "", 0.7),
            game(3, "Twin B", &["Puzzle"], "", 0.9),
            game(4, "Twin C", &["Puzzle"], "", 0.9),
        ];
        let model = SimilarityModel::build(games, SimilarityParams::default()).expect("build");
        let query = model.vector(GameId(1)).expect("vector").clone();
        let exclude = [GameId(1)].into_iter().collect();
        let order = model
            .top_k(&query, 3, &exclude)
            .into_iter()
            .map(|n| n.game_id.0)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![3, 4, 2]);
    }

    #[test]
    fn build_is_independent_of_input_order() {
        let forward = SimilarityModel::build(corpus(), SimilarityParams::default()).expect("build");
        let mut reversed_corpus = corpus();
        reversed_corpus.reverse();
        let reversed = SimilarityModel::build(reversed_corpus, SimilarityParams::default()).expect("build");

        assert_eq!(forward.fingerprint(), reversed.fingerprint());
        for game in forward.games() {
            let id = game.game.game_id;
            assert_eq!(forward.vector(id), reversed.vector(id));
            assert_eq!(forward.neighbors(id), reversed.neighbors(id));
        }
    }

    #[test]
    fn max_features_keeps_most_frequent_terms() {
        let params = SimilarityParams {
            max_features: 2,
            ..SimilarityParams::default()
        };
        let model = SimilarityModel::build(corpus(), params).expect("build");
        assert_eq!(model.vocabulary_size(), 2);
        // "farming", "shooter" and "space" each occur four times; ties go lexicographic.
        assert!(model.term_index("farming").is_some());
        assert!(model.term_index("shooter").is_some());
        assert!(model.term_index("space").is_none());
    }

    #[test]
    fn empty_and_duplicate_corpora_are_rejected() {
        assert!(matches!(
            SimilarityModel::build(Vec::new(), SimilarityParams::default()),
            Err(BuildError::EmptyCorpus)
        ));
        let dup = vec![game(1, "A", &[], "x", 0.5), game(1, "B", &[], "y", 0.5)];
        assert!(matches!(
            SimilarityModel::build(dup, SimilarityParams::default()),
            Err(BuildError::DuplicateGame(GameId(1)))
        ));
    }

    #[test]
    fn centroid_of_one_vector_is_itself() {
        let v = SparseVector::from_pairs([(3, 0.6), (1, 0.8)]);
        assert_eq!(SparseVector::centroid([&v]), v.clone().normalized());
        assert!((v.dot(&v) - 1.0).abs() < 1e-12);
    }
}
