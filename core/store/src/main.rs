use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use recall_schemas::{
    ExportFormat, MemoryFilter, MemoryId, MemoryPatch, MemoryType, NewMemory, OrganizeTask,
    ProposalId, RelationType, SearchQuery,
};
use recall_store::{Collaborators, MemoryConfig, MemoryError, MemoryStore};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:21960";

#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<MemoryStore>>,
}

type ApiError = (StatusCode, String);

fn status_for(err: &MemoryError) -> StatusCode {
    match err {
        MemoryError::NotFound(_) => StatusCode::NOT_FOUND,
        MemoryError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        MemoryError::Conflict(_) => StatusCode::CONFLICT,
        MemoryError::ExternalFailure(_) => StatusCode::BAD_GATEWAY,
        MemoryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Log and convert a store error for the response.
fn reject(action: &str, err: MemoryError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Failed to {}: {}", action, err);
    } else {
        warn!("Could not {}: {}", action, err);
    }
    (status, format!("{}: {}", err.kind(), err))
}

fn parse_arg<T>(raw: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Recall memory service v0.1.0");

    let config = MemoryConfig::from_env().context("invalid configuration")?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    info!("Database: {}", config.db_path.display());

    let store = MemoryStore::open(config, Collaborators::from_env()).context("failed to open memory store")?;
    let components = store.component_status();
    info!(
        "Components: lexical={} vector={} reasoning={}",
        components.lexical_index.as_str(),
        components.vector_index.as_str(),
        components.reasoning.as_str()
    );

    let state = AppState {
        store: Arc::new(Mutex::new(store)),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/memories", post(add_memory).get(list_memories))
        .route(
            "/memories/:id",
            get(get_memory).patch(update_memory).delete(delete_memory),
        )
        .route("/memories/:id/associated", get(get_associated))
        .route("/search", get(search))
        .route("/associations", post(associate).delete(unlink))
        .route("/graph/paths", get(find_paths))
        .route("/graph/clusters", get(clusters))
        .route("/graph/relink", post(relink))
        .route("/stats", get(stats))
        .route("/export", get(export))
        .route("/import", post(import))
        .route("/organize", post(organize).get(pending_proposals))
        .route("/organize/:id/apply", post(apply_organization))
        .route("/organize/:id", delete(discard_organization))
        .route("/index/rebuild", post(rebuild_index))
        .route("/repair", post(repair))
        .route("/ingest", post(ingest))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = std::env::var("RECALL_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.lock().await;
    Json(serde_json::json!({
        "service": "recall",
        "status": if store.is_consistent() { "healthy" } else { "inconsistent" },
        "version": "0.1.0",
        "components": store.component_status(),
    }))
}

async fn add_memory(
    State(state): State<AppState>,
    Json(request): Json<NewMemory>,
) -> Result<impl IntoResponse, ApiError> {
    let mut store = state.store.lock().await;
    let id = store.add(request).await.map_err(|e| reject("add memory", e))?;

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

async fn list_memories(
    State(state): State<AppState>,
    Query(filter): Query<MemoryFilter>,
) -> impl IntoResponse {
    let store = state.store.lock().await;
    Json(store.list(&filter))
}

async fn get_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.lock().await;
    let record = store
        .get(&MemoryId(id))
        .map_err(|e| reject("get memory", e))?;
    Ok(Json(record))
}

async fn update_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<MemoryPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let mut store = state.store.lock().await;
    let record = store
        .update(&MemoryId(id), patch)
        .await
        .map_err(|e| reject("update memory", e))?;
    Ok(Json(record))
}

async fn delete_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut store = state.store.lock().await;
    store
        .delete(&MemoryId(id.clone()))
        .map_err(|e| reject("delete memory", e))?;

    Ok(Json(serde_json::json!({
        "message": format!("Memory {} deleted", id)
    })))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default = "default_limit")]
    limit: usize,
    memory_type: Option<String>,
    min_importance: Option<f32>,
}

fn default_limit() -> usize {
    10
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let mut query = SearchQuery::new(params.q.clone(), params.limit);
    if let Some(raw) = &params.memory_type {
        query = query.memory_type(parse_arg::<MemoryType>(raw)?);
    }
    if let Some(min) = params.min_importance {
        query = query.min_importance(min);
    }

    let mut store = state.store.lock().await;
    let hits = store.search(&query).await.map_err(|e| reject("search", e))?;

    Ok(Json(serde_json::json!({
        "query": params.q,
        "count": hits.len(),
        "results": hits
    })))
}

#[derive(Debug, Deserialize)]
struct AssociateRequest {
    source: String,
    target: String,
    relation_type: String,
    weight: Option<f32>,
}

async fn associate(
    State(state): State<AppState>,
    Json(request): Json<AssociateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let relation_type = parse_arg::<RelationType>(&request.relation_type)?;

    let mut store = state.store.lock().await;
    let edge = store
        .associate(
            &MemoryId(request.source),
            &MemoryId(request.target),
            relation_type,
            request.weight,
        )
        .map_err(|e| reject("associate", e))?;
    Ok(Json(edge))
}

#[derive(Debug, Deserialize)]
struct UnlinkRequest {
    source: String,
    target: String,
    relation_type: String,
}

async fn unlink(
    State(state): State<AppState>,
    Json(request): Json<UnlinkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let relation_type = parse_arg::<RelationType>(&request.relation_type)?;

    let mut store = state.store.lock().await;
    let edge = store
        .unlink(&MemoryId(request.source), &MemoryId(request.target), relation_type)
        .map_err(|e| reject("unlink", e))?;
    Ok(Json(edge))
}

#[derive(Debug, Deserialize)]
struct AssociatedParams {
    #[serde(default = "default_limit")]
    max_results: usize,
}

async fn get_associated(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<AssociatedParams>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.lock().await;
    let associated = store
        .get_associated(&MemoryId(id), params.max_results)
        .map_err(|e| reject("get associated memories", e))?;
    Ok(Json(associated))
}

#[derive(Debug, Deserialize)]
struct PathParams {
    from: String,
    to: String,
}

async fn find_paths(
    State(state): State<AppState>,
    Query(params): Query<PathParams>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.lock().await;
    let paths = store
        .find_paths(&MemoryId(params.from), &MemoryId(params.to))
        .map_err(|e| reject("find paths", e))?;
    Ok(Json(paths))
}

async fn clusters(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.lock().await;
    Json(store.clusters())
}

async fn relink(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mut store = state.store.lock().await;
    let linked = store.relink_all().map_err(|e| reject("relink", e))?;
    Ok(Json(serde_json::json!({ "linked": linked })))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.lock().await;
    Json(store.stats())
}

#[derive(Debug, Deserialize)]
struct FormatParams {
    #[serde(default = "default_format")]
    format: String,
}

fn default_format() -> String {
    "json".to_string()
}

async fn export(
    State(state): State<AppState>,
    Query(params): Query<FormatParams>,
) -> Result<impl IntoResponse, ApiError> {
    let format = parse_arg::<ExportFormat>(&params.format)?;

    let store = state.store.lock().await;
    let body = store.export(format).map_err(|e| reject("export", e))?;

    let content_type = match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv; charset=utf-8",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], body))
}

async fn import(
    State(state): State<AppState>,
    Query(params): Query<FormatParams>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let format = parse_arg::<ExportFormat>(&params.format)?;

    let mut store = state.store.lock().await;
    let report = store.import(&body, format).map_err(|e| reject("import", e))?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct OrganizeRequest {
    tasks: Vec<String>,
    timeout_secs: Option<u64>,
}

async fn organize(
    State(state): State<AppState>,
    Json(request): Json<OrganizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = request
        .tasks
        .iter()
        .map(|raw| parse_arg::<OrganizeTask>(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let mut store = state.store.lock().await;
    let proposal = store
        .organize(&tasks, request.timeout_secs.map(Duration::from_secs))
        .await
        .map_err(|e| reject("organize", e))?;
    Ok(Json(proposal))
}

async fn pending_proposals(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.lock().await;
    let pending: Vec<_> = store.pending_proposals().into_iter().cloned().collect();
    Json(pending)
}

async fn apply_organization(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut store = state.store.lock().await;
    let summary = store
        .apply_organization(&ProposalId(id))
        .map_err(|e| reject("apply proposal", e))?;
    Ok(Json(summary))
}

async fn discard_organization(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut store = state.store.lock().await;
    let proposal = store
        .discard_organization(&ProposalId(id))
        .map_err(|e| reject("discard proposal", e))?;
    Ok(Json(proposal))
}

#[derive(Debug, Default, Deserialize)]
struct RebuildRequest {
    timeout_secs: Option<u64>,
}

async fn rebuild_index(
    State(state): State<AppState>,
    request: Option<Json<RebuildRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();

    let mut store = state.store.lock().await;
    let indexed = store
        .rebuild_vector_index(request.timeout_secs.map(Duration::from_secs))
        .await
        .map_err(|e| reject("rebuild vector index", e))?;
    Ok(Json(serde_json::json!({ "indexed": indexed })))
}

async fn repair(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mut store = state.store.lock().await;
    let report = store.repair().map_err(|e| reject("repair", e))?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    text: String,
    last_user_message: Option<String>,
}

async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut store = state.store.lock().await;
    let ids = store
        .ingest_text(&request.text, request.last_user_message.as_deref())
        .await
        .map_err(|e| reject("ingest text", e))?;

    Ok(Json(serde_json::json!({
        "count": ids.len(),
        "ids": ids
    })))
}
