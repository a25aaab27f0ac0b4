//! Build-then-swap holder for the current [`SimilarityModel`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gamerec_core::CorpusGame;
use gamerec_storage::GameStore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::similarity::{BuildError, SimilarityModel, SimilarityParams};

/// Where model builds read their corpus from.
#[async_trait]
pub trait CorpusSource: Send + Sync {
    async fn load_corpus(&self) -> Result<Vec<CorpusGame>, BuildError>;
}

pub struct StoreCorpus {
    store: Arc<dyn GameStore>,
}

impl StoreCorpus {
    pub fn new(store: Arc<dyn GameStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CorpusSource for StoreCorpus {
    async fn load_corpus(&self) -> Result<Vec<CorpusGame>, BuildError> {
        Ok(self.store.load_corpus().await?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub generation: u64,
    pub games: usize,
    pub vocabulary: usize,
    pub fingerprint: String,
    pub built_at: DateTime<Utc>,
    pub stale: bool,
}

/// Wait after a failed rebuild before a stale read tries again.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Holds at most one model. Builds are serialized; while one runs, readers keep getting the
/// previous snapshot, and the swap is a single pointer replacement. Builds are never
/// cancelled.
pub struct ModelCache {
    source: Arc<dyn CorpusSource>,
    params: SimilarityParams,
    current: RwLock<Option<Arc<SimilarityModel>>>,
    stale: AtomicBool,
    generation: AtomicU64,
    build_lock: Mutex<()>,
    retry_after: Duration,
    last_failure: std::sync::Mutex<Option<Instant>>,
}

impl ModelCache {
    pub fn new(source: Arc<dyn CorpusSource>, params: SimilarityParams) -> Self {
        Self {
            source,
            params,
            current: RwLock::new(None),
            stale: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            build_lock: Mutex::new(()),
            retry_after: DEFAULT_RETRY_AFTER,
            last_failure: std::sync::Mutex::new(None),
        }
    }

    /// How long stale reads keep serving the previous model after a failed rebuild before
    /// one of them tries again. [`Self::refresh`] ignores it.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn from_store(store: Arc<dyn GameStore>, params: SimilarityParams) -> Self {
        Self::new(Arc::new(StoreCorpus::new(store)), params)
    }

    /// The current model without triggering a build.
    pub fn current(&self) -> Option<Arc<SimilarityModel>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful swaps so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> Option<ModelInfo> {
        self.current().map(|model| ModelInfo {
            generation: self.generation(),
            games: model.len(),
            vocabulary: model.vocabulary_size(),
            fingerprint: model.fingerprint().to_string(),
            built_at: model.built_at(),
            stale: self.is_stale(),
        })
    }

    /// Marks the model stale; the next [`Self::get_or_build`] rebuilds it.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    fn cooling_down(&self) -> bool {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|failed_at| failed_at.elapsed() < self.retry_after)
    }

    fn set_last_failure(&self, at: Option<Instant>) {
        *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// Returns the cached model, building it on first use or after [`Self::invalidate`].
    /// While another caller is rebuilding, returns the previous model instead of waiting.
    /// A failed rebuild also falls back to the previous model and stays stale; the next
    /// attempt waits until the retry delay has passed.
    pub async fn get_or_build(&self) -> Result<Arc<SimilarityModel>, BuildError> {
        let previous = self.current();
        if let Some(model) = &previous {
            if !self.is_stale() || self.cooling_down() {
                return Ok(Arc::clone(model));
            }
        }

        let _guard = match previous {
            Some(model) => match self.build_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Ok(model),
            },
            None => self.build_lock.lock().await,
        };

        // Someone else may have finished, or failed, a build while we waited.
        if let Some(model) = self.current() {
            if !self.is_stale() || self.cooling_down() {
                return Ok(model);
            }
        }

        match self.build_and_swap().await {
            Ok(model) => Ok(model),
            Err(err) => match self.current() {
                Some(model) => {
                    warn!(error = %err, "model rebuild failed; serving previous model");
                    Ok(model)
                }
                None => Err(err),
            },
        }
    }

    /// Forces a rebuild, waiting for any build in progress. On failure the previous model
    /// stays in place and the error is returned.
    pub async fn refresh(&self) -> Result<Arc<SimilarityModel>, BuildError> {
        let _guard = self.build_lock.lock().await;
        self.build_and_swap().await
    }

    /// Caller must hold `build_lock`.
    async fn build_and_swap(&self) -> Result<Arc<SimilarityModel>, BuildError> {
        self.stale.store(false, Ordering::SeqCst);
        let result = self.build().await;
        match result {
            Ok(model) => {
                self.set_last_failure(None);
                let model = Arc::new(model);
                *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&model));
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                info!(generation, games = model.len(), "similarity model swapped in");
                Ok(model)
            }
            Err(err) => {
                self.set_last_failure(Some(Instant::now()));
                self.stale.store(true, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn build(&self) -> Result<SimilarityModel, BuildError> {
        let corpus = self.source.load_corpus().await?;
        let params = self.params;
        tokio::task::spawn_blocking(move || SimilarityModel::build(corpus, params))
            .await
            .map_err(|err| BuildError::Join(err.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::tests::game;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingSource {
        corpus: std::sync::Mutex<Vec<CorpusGame>>,
        loads: AtomicUsize,
        delay: Duration,
        fail: AtomicBool,
    }

    impl CountingSource {
        fn new(corpus: Vec<CorpusGame>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                corpus: std::sync::Mutex::new(corpus),
                loads: AtomicUsize::new(0),
                delay,
                fail: AtomicBool::new(false),
            })
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CorpusSource for CountingSource {
        async fn load_corpus(&self) -> Result<Vec<CorpusGame>, BuildError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(BuildError::EmptyCorpus);
            }
            Ok(self.corpus.lock().expect("corpus lock").clone())
        }
    }

    fn corpus() -> Vec<CorpusGame> {
        vec![
            game(1, "A", &["Puzzle"], "block puzzle", 0.9),
            game(2, "B", &["Puzzle"], "tile puzzle", 0.8),
        ]
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let source = CountingSource::new(corpus(), Duration::ZERO);
        let cache = ModelCache::new(source.clone(), SimilarityParams::default());

        let first = cache.get_or_build().await.expect("build");
        let second = cache.get_or_build().await.expect("cached");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.loads(), 1);
        assert_eq!(cache.generation(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_access_builds_once() {
        let source = CountingSource::new(corpus(), Duration::from_millis(20));
        let cache = ModelCache::new(source.clone(), SimilarityParams::default());

        let (a, b, c) = tokio::join!(cache.get_or_build(), cache.get_or_build(), cache.get_or_build());
        let (a, b, c) = (a.expect("a"), b.expect("b"), c.expect("c"));
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(source.loads(), 1);
    }

    #[tokio::test]
    async fn readers_get_previous_model_during_rebuild() {
        let source = CountingSource::new(corpus(), Duration::from_millis(50));
        let cache = ModelCache::new(source.clone(), SimilarityParams::default());
        let old = cache.get_or_build().await.expect("initial build");

        source
            .corpus
            .lock()
            .expect("corpus lock")
            .push(game(3, "C", &["Puzzle"], "sliding puzzle", 0.7));
        cache.invalidate();

        let (rebuilt, during) = tokio::join!(cache.get_or_build(), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cache.get_or_build().await
        });
        let rebuilt = rebuilt.expect("rebuild");
        let during = during.expect("reader");

        assert!(Arc::ptr_eq(&during, &old));
        assert_eq!(rebuilt.len(), 3);
        assert_eq!(source.loads(), 2);
        assert_eq!(cache.generation(), 2);
        assert!(Arc::ptr_eq(&cache.get_or_build().await.expect("after"), &rebuilt));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_model() {
        let source = CountingSource::new(corpus(), Duration::ZERO);
        let cache = ModelCache::new(source.clone(), SimilarityParams::default());
        let old = cache.get_or_build().await.expect("initial build");

        source.fail.store(true, Ordering::SeqCst);
        assert!(cache.refresh().await.is_err());
        assert!(Arc::ptr_eq(&cache.current().expect("still cached"), &old));
        assert!(cache.is_stale());

        let served = cache.get_or_build().await.expect("falls back");
        assert!(Arc::ptr_eq(&served, &old));

        source.fail.store(false, Ordering::SeqCst);
        let fresh = cache.refresh().await.expect("refresh");
        assert!(!Arc::ptr_eq(&fresh, &old));
        assert!(!cache.is_stale());
        assert_eq!(cache.generation(), 2);
    }

    #[tokio::test]
    async fn failed_rebuild_is_not_retried_until_the_delay_passes() {
        let source = CountingSource::new(corpus(), Duration::ZERO);
        let cache = ModelCache::new(source.clone(), SimilarityParams::default())
            .with_retry_after(Duration::from_millis(200));
        let old = cache.get_or_build().await.expect("initial build");

        source.fail.store(true, Ordering::SeqCst);
        cache.invalidate();
        assert!(Arc::ptr_eq(&cache.get_or_build().await.expect("fallback"), &old));
        assert_eq!(source.loads(), 2);
        for _ in 0..5 {
            assert!(Arc::ptr_eq(&cache.get_or_build().await.expect("previous"), &old));
        }
        assert_eq!(source.loads(), 2);
        assert!(cache.is_stale());

        source.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;
        let fresh = cache.get_or_build().await.expect("retried");
        assert!(!Arc::ptr_eq(&fresh, &old));
        assert_eq!(source.loads(), 3);
        assert!(!cache.is_stale());
    }

    #[tokio::test]
    async fn first_build_error_surfaces() {
        let source = CountingSource::new(Vec::new(), Duration::ZERO);
        let cache = ModelCache::new(source, SimilarityParams::default());
        assert!(matches!(cache.get_or_build().await, Err(BuildError::EmptyCorpus)));
        assert!(cache.current().is_none());
    }
}
