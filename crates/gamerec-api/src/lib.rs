//! JSON HTTP surface over the recommendation service.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gamerec_core::{normalize_tag, GameId, PriceRange, RecommendationFilters};
use gamerec_recommend::{
    service_for_store, BuildError, RecommendConfig, RecommendError, RecommendationService,
};
use gamerec_storage::{GameStore, MemoryGameStore, PgGameStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "gamerec-api";

const DEFAULT_K: usize = 10;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    /// In-memory store when unset.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub recommend: RecommendConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            database_url: None,
            max_connections: 8,
            recommend: RecommendConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("GAMEREC_API_PORT")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            ..defaults
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: RecommendationService,
    pub store: Arc<dyn GameStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn GameStore>, config: RecommendConfig) -> Self {
        Self {
            service: service_for_store(Arc::clone(&store), config),
            store,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/recommendations/by-title", get(by_title_handler))
        .route("/recommendations/profile", post(profile_handler))
        .route("/recommendations/{game_id}", get(recommendations_handler))
        .route("/games/{game_id}/neighbors", get(neighbors_handler))
        .route("/model", get(model_handler))
        .route("/model/refresh", post(refresh_handler))
        .with_state(Arc::new(state))
}

pub async fn connect_store(config: &ServiceConfig) -> anyhow::Result<Arc<dyn GameStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgGameStore::connect(url, config.max_connections)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; serving from an empty in-memory store");
            Ok(Arc::new(MemoryGameStore::new()))
        }
    }
}

/// Serves `store` until the process is stopped. The model is built eagerly so the first
/// request does not pay for it; an empty store is logged and retried on demand.
pub async fn serve(config: &ServiceConfig, store: Arc<dyn GameStore>) -> anyhow::Result<()> {
    let state = AppState::new(store, config.recommend.clone());
    match state.service.cache().get_or_build().await {
        Ok(model) => info!(games = model.len(), "similarity model ready"),
        Err(err) => warn!(error = %err, "similarity model not built at startup"),
    }
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "gamerec api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env();
    let store = connect_store(&config).await?;
    serve(&config, store).await
}

pub struct ApiError(RecommendError);

impl From<RecommendError> for ApiError {
    fn from(err: RecommendError) -> Self {
        Self(err)
    }
}

impl From<BuildError> for ApiError {
    fn from(err: BuildError) -> Self {
        Self(RecommendError::Build(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RecommendError::NotFound(_) | RecommendError::TitleNotFound(_) => StatusCode::NOT_FOUND,
            RecommendError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            RecommendError::Build(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// `tag` is comma separated; a lone `min_price` or `max_price` leaves the other end open.
#[derive(Debug, Deserialize, Default)]
struct RecommendQuery {
    k: Option<usize>,
    tag: Option<String>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    language: Option<String>,
}

impl RecommendQuery {
    fn k(&self) -> usize {
        self.k.unwrap_or(DEFAULT_K)
    }

    fn filters(&self) -> RecommendationFilters {
        let tags = self
            .tag
            .as_deref()
            .map(|raw| raw.split(',').filter_map(normalize_tag).collect())
            .unwrap_or_default();
        let price_range = match (self.min_price, self.max_price) {
            (None, None) => None,
            (min, max) => Some(PriceRange {
                min: min.unwrap_or(0.0),
                max: max.unwrap_or(f64::MAX),
            }),
        };
        RecommendationFilters {
            tags,
            price_range,
            language: self
                .language
                .as_deref()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_lowercase),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TitleQuery {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ProfileRequest {
    liked: Vec<GameId>,
    k: Option<usize>,
    #[serde(default)]
    filters: RecommendationFilters,
}

#[derive(Debug, Serialize)]
struct TitleRecommendations {
    game_id: GameId,
    recommendations: Vec<gamerec_core::Recommendation>,
}

#[derive(Debug, Deserialize, Default)]
struct NeighborsQuery {
    k: Option<usize>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.counts().await {
        Ok(counts) => Json(json!({
            "status": "ok",
            "games": counts.games,
            "reviews": counts.reviews,
            "model_generation": state.service.cache().generation(),
        }))
        .into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn recommendations_handler(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<i64>,
    Query(query): Query<RecommendQuery>,
) -> Result<Response, ApiError> {
    let recs = state
        .service
        .recommend(GameId(game_id), query.k(), &query.filters())
        .await?;
    Ok(Json(recs).into_response())
}

async fn by_title_handler(
    State(state): State<Arc<AppState>>,
    Query(title): Query<TitleQuery>,
    Query(query): Query<RecommendQuery>,
) -> Result<Response, ApiError> {
    let game_id = state.service.resolve_title(&title.title).await?;
    let recommendations = state
        .service
        .recommend(game_id, query.k(), &query.filters())
        .await?;
    Ok(Json(TitleRecommendations {
        game_id,
        recommendations,
    })
    .into_response())
}

async fn profile_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ProfileRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|err| RecommendError::InvalidArgument(err.body_text()))?;
    let recs = state
        .service
        .recommend_for_profile(&request.liked, request.k.unwrap_or(DEFAULT_K), &request.filters)
        .await?;
    Ok(Json(recs).into_response())
}

async fn neighbors_handler(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<i64>,
    Query(query): Query<NeighborsQuery>,
) -> Result<Response, ApiError> {
    let neighbors = state
        .service
        .similar_games(GameId(game_id), query.k.unwrap_or(DEFAULT_K))
        .await?;
    Ok(Json(neighbors).into_response())
}

async fn model_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.cache().info() {
        Some(info) => Json(info).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no model has been built yet" })),
        )
            .into_response(),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let cache = state.service.cache();
    cache.refresh().await?;
    info!(generation = cache.generation(), "model refreshed on request");
    Ok(Json(cache.info()).into_response())
}
