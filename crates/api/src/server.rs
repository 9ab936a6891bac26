use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use query::{Answer, EntityInfo, EntitySummary, GraphQueryEngine, GraphStats};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

type AppState = Arc<GraphQueryEngine>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    nodes: usize,
    edges: usize,
    llm: bool,
}

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    max_entities: Option<usize>,
}

#[derive(Deserialize)]
struct PathRequest {
    source: String,
    target: String,
    max_depth: Option<usize>,
}

#[derive(Serialize)]
struct PathResponse {
    source: String,
    target: String,
    paths: Vec<Vec<String>>,
    count: usize,
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<EntitySummary>,
    count: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(message: String) -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: message }))
}

pub fn router(engine: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/query", post(answer_query))
        .route("/entity/:name", get(get_entity))
        .route("/path", post(find_path))
        .route("/stats", get(get_stats))
        .route("/search_entities", post(search_entities))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Serves the query API until `shutdown` fires.
pub async fn serve(engine: GraphQueryEngine, bind: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;

    tracing::info!(
        bind,
        nodes = engine.graph().node_count(),
        edges = engine.graph().edge_count(),
        "Query service listening"
    );

    axum::serve(listener, router(Arc::new(engine)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Query service failed")
}

async fn health_check(State(engine): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        nodes: engine.graph().node_count(),
        edges: engine.graph().edge_count(),
        llm: engine.has_llm(),
    })
}

async fn answer_query(
    State(engine): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<Answer>, ApiError> {
    if req.query.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "query must not be empty".to_string(),
            }),
        ));
    }
    let limit = req.max_entities.unwrap_or(engine.config().max_entities);
    Ok(Json(engine.answer_with_limit(&req.query, limit).await))
}

async fn get_entity(
    State(engine): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<EntityInfo>, ApiError> {
    engine
        .get_entity_info(&name)
        .map(Json)
        .ok_or_else(|| not_found(format!("Entity '{name}' not found")))
}

async fn find_path(
    State(engine): State<AppState>,
    Json(req): Json<PathRequest>,
) -> Result<Json<PathResponse>, ApiError> {
    for name in [&req.source, &req.target] {
        if engine.get_entity_info(name).is_none() {
            return Err(not_found(format!("Entity '{name}' not found")));
        }
    }

    let depth = req.max_depth.unwrap_or(engine.config().max_path_depth);
    let paths = engine.find_paths(&req.source, &req.target, depth);
    Ok(Json(PathResponse {
        count: paths.len(),
        source: req.source,
        target: req.target,
        paths,
    }))
}

async fn get_stats(State(engine): State<AppState>) -> Json<GraphStats> {
    Json(engine.stats(engine.config().top_entities))
}

async fn search_entities(
    State(engine): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Json<SearchResponse> {
    let limit = req.limit.unwrap_or(engine.config().search_limit);
    let results = engine.search_entities(&req.query, limit);
    Json(SearchResponse {
        count: results.len(),
        query: req.query,
        results,
    })
}
