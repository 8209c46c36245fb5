//! HTTP search API
//!
//! Endpoints: `/search` (semantic path), `/search_keyword` (per-source
//! ILIKE fallback), `/hydrate` (single record), `/status`, `/health`.
//! Errors use a uniform `{"error":{"kind","message"}}` body.

use crate::config::SearchConfig;
use crate::error::{Error, Result};
use crate::search::{SearchOrchestrator, SearchRequest, SearchResultItem};
use crate::source::{SourceReader, SourceRegistry};
use crate::state::SyncStateStore;
use crate::store::VectorStore;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SearchOrchestrator>,
    pub registry: Arc<SourceRegistry>,
    pub reader: SourceReader,
    pub state: SyncStateStore,
    pub store: Arc<VectorStore>,
    pub search_config: SearchConfig,
    pub embedding_version: String,
}

/// Start serving on `bind` until the process is terminated.
pub async fn run_server(state: AppState, bind: &str) -> Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/search", get(handle_search))
        .route("/search_keyword", get(handle_search_keyword))
        .route("/hydrate", get(handle_hydrate))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!("search API listening on http://{}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error envelope ============

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: String,
    message: String,
}

struct AppError(Error);

/// HTTP status for each error kind. Expansion failures never reach
/// here; hydration gaps surface as missing fields, not errors.
fn status_for(error: &Error) -> StatusCode {
    match error.kind() {
        "EMPTY_QUERY" | "CONFIG_INVALID" => StatusCode::BAD_REQUEST,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "EMBED_UNAVAILABLE" | "EMBED_BUSY" | "VECTOR_UNAVAILABLE" | "DB_UNAVAILABLE" => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        "CANCELLED" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.0.kind().to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(error: Error) -> Self {
        AppError(error)
    }
}

// ============ GET /search ============

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    topk: Option<usize>,
    page_size: Option<usize>,
    #[serde(default)]
    cursor: usize,
    exclude_nsfw: Option<bool>,
    #[serde(default)]
    tmdb_only: bool,
    size_min_bytes: Option<i64>,
    tmdb_expand: Option<bool>,
    #[serde(default)]
    lite: bool,
    #[serde(default)]
    debug: bool,
}

/// Clamp and default the raw query parameters into a SearchRequest.
fn build_search_request(params: &SearchParams, config: &SearchConfig, expand_default: bool) -> SearchRequest {
    let topk = params
        .topk
        .or(params.page_size)
        .unwrap_or(config.topk)
        .clamp(1, 100);
    let fetch_k = config.fetch_k.max(topk);
    SearchRequest {
        q: params.q.clone(),
        topk,
        fetch_k,
        exclude_nsfw: params.exclude_nsfw.unwrap_or(config.exclude_nsfw_default),
        tmdb_only: params.tmdb_only,
        size_min_bytes: params.size_min_bytes,
        tmdb_expand: params.tmdb_expand.unwrap_or(expand_default),
        lite: params.lite,
        debug: params.debug,
        cursor: params.cursor,
    }
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> std::result::Result<Response, AppError> {
    let request = build_search_request(&params, &state.search_config, true);
    let response = state.orchestrator.search(&request).await?;
    Ok(Json(response).into_response())
}

// ============ GET /search_keyword ============

#[derive(Debug, Deserialize)]
struct KeywordParams {
    #[serde(default)]
    q: String,
    /// Restrict to one source; default is every keyword-enabled source
    source: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct KeywordResponse {
    count: usize,
    results: Vec<SearchResultItem>,
}

async fn handle_search_keyword(
    State(state): State<AppState>,
    Query(params): Query<KeywordParams>,
) -> std::result::Result<Json<KeywordResponse>, AppError> {
    let q = params.q.trim();
    if q.is_empty() {
        return Err(Error::EmptyQuery.into());
    }
    let limit = params.limit.unwrap_or(state.search_config.topk).clamp(1, 100);

    let mut results = Vec::new();
    for spec in state.registry.iter() {
        if !spec.keyword_search {
            continue;
        }
        if let Some(only) = &params.source {
            if only != &spec.name {
                continue;
            }
        }
        let rows = state.reader.search_by_keyword(spec, q, limit).await?;
        results.extend(rows.into_iter().map(|row| SearchResultItem {
            source: spec.name.clone(),
            pg_id: row.pg_id,
            title: row.title,
            score: 0.0,
            nsfw: false,
            nsfw_score: 0.0,
            metadata: row.metadata,
        }));
    }

    Ok(Json(KeywordResponse {
        count: results.len(),
        results,
    }))
}

// ============ GET /hydrate ============

#[derive(Debug, Deserialize)]
struct HydrateParams {
    source: String,
    id: String,
    #[serde(default)]
    lite: bool,
}

#[derive(Debug, Serialize)]
struct HydrateResponse {
    source: String,
    pg_id: String,
    title: String,
    metadata: serde_json::Map<String, serde_json::Value>,
}

async fn handle_hydrate(
    State(state): State<AppState>,
    Query(params): Query<HydrateParams>,
) -> std::result::Result<Json<HydrateResponse>, AppError> {
    let spec = state
        .registry
        .get(&params.source)
        .ok_or_else(|| Error::NotFound(format!("unknown source: {}", params.source)))?;
    let ids = vec![params.id.clone()];
    let mut rows = state.reader.fetch_by_ids(spec, &ids, params.lite).await?;
    let row = rows
        .remove(&params.id)
        .ok_or_else(|| Error::NotFound(format!("{}:{}", params.source, params.id)))?;
    Ok(Json(HydrateResponse {
        source: params.source,
        pg_id: row.pg_id,
        title: row.title,
        metadata: row.metadata,
    }))
}

// ============ GET /status ============

#[derive(Debug, Serialize)]
struct SourceStatus {
    name: String,
    total: i64,
    tracked: i64,
    synced: i64,
    errors: i64,
    last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    vector_store: VectorStoreStatus,
    embedding_version: String,
    sources: Vec<SourceStatus>,
}

#[derive(Debug, Serialize)]
struct VectorStoreStatus {
    kind: &'static str,
    count: usize,
    healthy: bool,
}

async fn handle_status(
    State(state): State<AppState>,
) -> std::result::Result<Json<StatusResponse>, AppError> {
    let count = state.store.count().await.unwrap_or(0);
    let healthy = state.store.health().await.is_ok();

    let mut sources = Vec::new();
    for spec in state.registry.iter() {
        let stats = state.state.source_stats(&spec.name).await?;
        let total = state.reader.count(spec).await.unwrap_or(-1);
        sources.push(SourceStatus {
            name: spec.name.clone(),
            total,
            tracked: stats.tracked,
            synced: stats.synced,
            errors: stats.errors,
            last_sync_at: stats.last_sync_at,
        });
    }

    Ok(Json(StatusResponse {
        vector_store: VectorStoreStatus {
            kind: state.store.kind(),
            count,
            healthy,
        },
        embedding_version: state.embedding_version.clone(),
        sources,
    }))
}

// ============ GET /health ============

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    vector_index_size: usize,
    embedding_version: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        vector_index_size: state.store.count().await.unwrap_or(0),
        embedding_version: state.embedding_version.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_query_maps_to_400_with_kind() {
        assert_eq!(status_for(&Error::EmptyQuery), StatusCode::BAD_REQUEST);

        let body = ErrorBody {
            error: ErrorDetail {
                kind: Error::EmptyQuery.kind().to_string(),
                message: Error::EmptyQuery.to_string(),
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["kind"], "EMPTY_QUERY");
    }

    #[test]
    fn test_unavailable_backends_map_to_503() {
        assert_eq!(
            status_for(&Error::EmbedUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::VectorUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::EmbedBusy("queue full".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_build_search_request_defaults_and_clamps() {
        let config = SearchConfig {
            topk: 20,
            fetch_k: 100,
            gpu_timeout_seconds: 15.0,
            exclude_nsfw_default: true,
        };
        let params = SearchParams {
            q: "matrix".to_string(),
            topk: None,
            page_size: None,
            cursor: 0,
            exclude_nsfw: None,
            tmdb_only: false,
            size_min_bytes: None,
            tmdb_expand: None,
            lite: false,
            debug: false,
        };
        let request = build_search_request(&params, &config, true);
        assert_eq!(request.topk, 20);
        assert_eq!(request.fetch_k, 100);
        assert!(request.exclude_nsfw);
        assert!(request.tmdb_expand);

        let params = SearchParams {
            topk: Some(500),
            exclude_nsfw: Some(false),
            ..params
        };
        let request = build_search_request(&params, &config, true);
        assert_eq!(request.topk, 100);
        assert!(!request.exclude_nsfw);
        assert!(request.fetch_k >= request.topk);
    }
}
