//! HTTP surface for the dashboard: run triggers, preview, export and
//! read-only catalog/listing endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::engine::{NarrativeEngine, Preview, RunReport};
use crate::error::EngineError;
use crate::models::RULE_CATEGORIES;
use crate::report::{self, ExportFormat};
use crate::rules::CancelFlag;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<NarrativeEngine>,
    /// Raised on shutdown; runs in flight stop between rules.
    pub shutdown: CancelFlag,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
        EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/signals/types/available", get(signal_types))
        .route("/playbooks/categories/available", get(categories))
        .route("/playbooks/evaluate", post(evaluate))
        .route("/playbooks/preview", post(preview))
        .route("/narratives", get(list_narratives))
        .route("/narratives/auto-generate", post(auto_generate))
        .route("/narratives/export/:id", post(export))
        .route("/narratives/:id", get(get_narrative))
        .route("/narratives/:id/insights", get(insights))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn signal_types(State(state): State<AppState>) -> Json<Value> {
    let types: Vec<Value> = state
        .engine
        .catalog()
        .kinds()
        .into_iter()
        .map(|kind| json!({"value": kind.as_str(), "label": kind.display_name()}))
        .collect();
    Json(json!({ "signal_types": types }))
}

async fn categories() -> Json<Value> {
    Json(json!({ "categories": RULE_CATEGORIES }))
}

/// Partial results travel with the failure so the caller sees how far the
/// run got before retrying.
fn run_response(report: RunReport) -> Response {
    let mut body = serde_json::to_value(&report).unwrap_or_else(|_| json!({}));
    match &report.failure {
        Some(err) => {
            let status = status_for(err);
            body["error"] = Value::from(err.to_string());
            body["retryable"] = Value::from(err.is_retryable());
            (status, Json(body)).into_response()
        }
        None => (StatusCode::OK, Json(body)).into_response(),
    }
}

async fn evaluate(State(state): State<AppState>) -> Response {
    run_response(state.engine.evaluate_rules(&state.shutdown).await)
}

async fn auto_generate(State(state): State<AppState>) -> Response {
    run_response(state.engine.auto_generate(&state.shutdown).await)
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub definition: Value,
    #[serde(default)]
    pub name: Option<String>,
}

async fn preview(
    State(state): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<Preview>, ApiError> {
    let name = request.name.as_deref().unwrap_or("Preview");
    Ok(Json(state.engine.preview(name, &request.definition).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

async fn list_narratives(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = query.offset.unwrap_or(0);
    let narratives = state.engine.list_narratives(limit, offset).await?;
    let items: Vec<Value> = narratives.iter().map(report::narrative_json).collect();
    Ok(Json(json!({ "narratives": items, "limit": limit, "offset": offset })))
}

async fn get_narrative(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let narrative = state.engine.narrative(id).await?;
    Ok(Json(report::narrative_json(&narrative)))
}

async fn insights(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let insights = state.engine.insights(id).await?;
    Ok(Json(json!({ "narrative_id": id, "insights": insights })))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: Option<String>,
}

async fn export(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Result<Json<Value>, ApiError> {
    let format: ExportFormat = query.format.as_deref().unwrap_or("markdown").parse()?;
    let bytes = state.engine.export(id, format).await?;
    Ok(Json(json!({
        "content": String::from_utf8_lossy(&bytes),
        "format": match format {
            ExportFormat::Markdown => "markdown",
            ExportFormat::Json => "json",
        },
        "content_type": format.content_type(),
    })))
}
