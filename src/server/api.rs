use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::TimeDelta;
use serde::Deserialize;
use tracing::error;

use crate::errors::PipelineError;
use crate::pipeline::{EventBus, IntentRequest, Pipeline};
use crate::store::{Adjustments, NewDocument, NewRun, UnitAdjustment};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub pipeline: Pipeline,
    pub events: EventBus,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListRunsQuery {
    pub user_id: Option<String>,
    pub limit: Option<usize>,
}

/// Confirmation body. `exclude` is shorthand for `{"name": {"include": false}}`.
#[derive(Deserialize, Default)]
pub struct ConfirmRequest {
    #[serde(default)]
    pub adjustments: Adjustments,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ConfirmRequest {
    pub fn into_adjustments(self) -> Adjustments {
        let mut adjustments = self.adjustments;
        for name in self.exclude {
            adjustments.insert(name, UnitAdjustment { include: false });
        }
        adjustments
    }
}

#[derive(Deserialize)]
pub struct QueryRequest {
    pub question: String,
}

#[derive(Deserialize)]
pub struct ListQueriesQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct PurgeQuery {
    pub older_than_hours: Option<i64>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::RunNotFound { .. } => ApiError::NotFound(err.to_string()),
            PipelineError::Validation(_) | PipelineError::NoActiveUnits { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            PipelineError::InvalidTransition { .. }
            | PipelineError::NotAwaitingConfirmation { .. }
            | PipelineError::RunTerminal { .. } => ApiError::Conflict(err.to_string()),
            PipelineError::Database(_)
            | PipelineError::Other(_)
            | PipelineError::Reasoning(_)
            | PipelineError::Malformed(_) => {
                error!(error = %err, "request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", get(list_runs).post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/confirm", post(confirm_run))
        .route("/api/runs/{id}/resume", post(resume_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/retry-dlq", post(retry_dlq))
        .route("/api/runs/{id}/purge", post(purge_jobs))
        .route("/api/runs/{id}/export", get(export_run))
        .route("/api/runs/{id}/documents", get(list_documents).post(ingest_document))
        .route("/api/runs/{id}/query", post(query_run))
        .route("/api/runs/{id}/queries", get(list_queries))
        .route("/api/intent", post(translate_intent))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_run(
    State(state): State<SharedState>,
    Json(req): Json<NewRun>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.pipeline.create(req).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state
        .pipeline
        .list(query.user_id, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.status(id).await?))
}

async fn confirm_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ConfirmRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.pipeline.confirm(id, req.into_adjustments()).await?;
    Ok(Json(run))
}

async fn resume_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.pipeline.resume(id).await?;
    Ok(Json(serde_json::json!({"run_id": id, "outcome": outcome})))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.cancel(id).await?))
}

async fn retry_dlq(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let requeued = state.pipeline.retry_dlq(id).await?;
    Ok(Json(serde_json::json!({"run_id": id, "requeued": requeued})))
}

async fn purge_jobs(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<PurgeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let retention = match query.older_than_hours {
        Some(hours) if hours < 0 => {
            return Err(ApiError::BadRequest("older_than_hours must not be negative".into()));
        }
        Some(hours) => Some(TimeDelta::hours(hours)),
        None => None,
    };
    let purged = state.pipeline.purge(id, retention).await?;
    Ok(Json(serde_json::json!({"run_id": id, "purged": purged})))
}

async fn export_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.pipeline.export(id).await?;
    Ok(([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], report))
}

async fn ingest_document(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<NewDocument>,
) -> Result<impl IntoResponse, ApiError> {
    let document = state.pipeline.ingest(id, req).await?;
    Ok((StatusCode::ACCEPTED, Json(document)))
}

async fn list_documents(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.documents(id).await?))
}

async fn query_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<QueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.query(id, &req.question).await?))
}

async fn list_queries(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<ListQueriesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let queries = state.pipeline.queries(id, query.limit.unwrap_or(50)).await?;
    Ok(Json(queries))
}

async fn translate_intent(
    State(state): State<SharedState>,
    Json(req): Json<IntentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.translate_intent(&req).await?))
}
