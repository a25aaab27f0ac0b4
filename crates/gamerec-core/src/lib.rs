//! Core domain model for the game catalog pipeline and recommender.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod batch;

pub use batch::{BatchError, Column, ColumnBatch, ColumnType, RowOrdinal, Value};

pub const CRATE_NAME: &str = "gamerec-core";

/// Natural key of a catalog entry (the store's app id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(pub i64);

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for GameId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Canonical persisted catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub game_id: GameId,
    pub title: String,
    pub release_year: Option<i32>,
    pub price: f64,
    pub tags: BTreeSet<String>,
    pub positive_ratio: f64,
    pub review_count: i64,
    pub owners_estimate: i64,
    pub description: String,
}

impl GameRecord {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// Canonical persisted player review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub review_key: String,
    pub game_id: GameId,
    pub language: String,
    pub recommended: bool,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A game together with the review-side aggregates the recommender reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusGame {
    pub game: GameRecord,
    #[serde(default)]
    pub review_languages: BTreeSet<String>,
}

impl From<GameRecord> for CorpusGame {
    fn from(game: GameRecord) -> Self {
        Self {
            game,
            review_languages: BTreeSet::new(),
        }
    }
}

/// One ranked recommendation; built per query and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub game_id: GameId,
    pub title: String,
    pub rank: usize,
    pub score: f64,
    pub similarity: f64,
    pub justifications: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

impl PriceRange {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.min && price <= self.max
    }

    pub fn is_well_formed(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

/// Query-time narrowing applied to recommendation candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationFilters {
    /// Candidate must carry at least one of these tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub price_range: Option<PriceRange>,
    /// Candidate must have at least one stored review in this language.
    #[serde(default)]
    pub language: Option<String>,
}

/// Trim and collapse inner whitespace; empty labels are dropped.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let tag = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    NullViolation,
    TypeMismatch,
    RangeViolation,
    NotAllowed,
    DuplicateKey,
    OrphanedReview,
}

impl RuleKind {
    pub fn tag(&self) -> &'static str {
        match self {
            RuleKind::NullViolation => "null violation",
            RuleKind::TypeMismatch => "type mismatch",
            RuleKind::RangeViolation => "range violation",
            RuleKind::NotAllowed => "value not allowed",
            RuleKind::DuplicateKey => "duplicate key",
            RuleKind::OrphanedReview => "orphaned review",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A single rejected row and the first rule it broke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub dataset: String,
    pub ordinal: RowOrdinal,
    pub rule: RuleKind,
    pub column: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetCounts {
    pub examined: u64,
    pub rejected: u64,
}

/// Per-run data-quality audit record. Built once by the validator's report builder and
/// read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    run_id: Uuid,
    created_at: DateTime<Utc>,
    datasets: BTreeMap<String, DatasetCounts>,
    rule_counts: BTreeMap<RuleKind, u64>,
    rejections: Vec<Rejection>,
}

impl ValidationReport {
    pub fn new(
        run_id: Uuid,
        created_at: DateTime<Utc>,
        datasets: BTreeMap<String, DatasetCounts>,
        rejections: Vec<Rejection>,
    ) -> Self {
        let mut rule_counts = BTreeMap::new();
        for rejection in &rejections {
            *rule_counts.entry(rejection.rule).or_insert(0) += 1;
        }
        Self {
            run_id,
            created_at,
            datasets,
            rule_counts,
            rejections,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn datasets(&self) -> &BTreeMap<String, DatasetCounts> {
        &self.datasets
    }

    pub fn rule_counts(&self) -> &BTreeMap<RuleKind, u64> {
        &self.rule_counts
    }

    pub fn rejections(&self) -> &[Rejection] {
        &self.rejections
    }

    pub fn rows_examined(&self) -> u64 {
        self.datasets.values().map(|c| c.examined).sum()
    }

    pub fn rows_rejected(&self) -> u64 {
        self.datasets.values().map(|c| c.rejected).sum()
    }

    /// First `n` rejections in the order they were recorded.
    pub fn examples(&self, n: usize) -> &[Rejection] {
        &self.rejections[..self.rejections.len().min(n)]
    }
}
