//! Hybrid content-based recommendations: a TF-IDF similarity index over tags and
//! descriptions, blended with review quality and explained by declarative rules.

use std::sync::Arc;

use gamerec_storage::GameStore;

pub mod cache;
pub mod explain;
pub mod service;
pub mod similarity;

pub use cache::{CorpusSource, ModelCache, ModelInfo, StoreCorpus};
pub use explain::{default_rules, justify, JustificationRule, PriceBracket, Reference};
pub use service::{rank, resolve_title_in, RecommendConfig, RecommendError, RecommendationService};
pub use similarity::{BuildError, Neighbor, SimilarityModel, SimilarityParams, SparseVector};

pub const CRATE_NAME: &str = "gamerec-recommend";

/// Service over a lazily built model of everything in `store`.
pub fn service_for_store(store: Arc<dyn GameStore>, config: RecommendConfig) -> RecommendationService {
    let cache = ModelCache::from_store(store, SimilarityParams::default());
    RecommendationService::new(Arc::new(cache), config)
}
