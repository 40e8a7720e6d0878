use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::archive::LogArchive;
use crate::config::Config;
use crate::db::DbHandle;
use crate::events::EventSink;
use crate::llm::FileGenerator;
use crate::models::new_job_id;
use crate::pipeline::{self, PipelineDeps};
use crate::sandbox::SandboxRuntime;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: DbHandle,
    pub archive: Arc<dyn LogArchive>,
    pub runtime: Arc<dyn SandboxRuntime>,
    pub llm: Arc<dyn FileGenerator>,
    pub config: Arc<Config>,
}

impl AppState {
    fn pipeline_deps(&self) -> PipelineDeps {
        PipelineDeps {
            store: self.store.clone(),
            archive: Arc::clone(&self.archive),
            runtime: Arc::clone(&self.runtime),
            llm: Arc::clone(&self.llm),
            config: Arc::clone(&self.config),
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub prompt: Option<String>,
    pub model: Option<String>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(rename = "type")]
    pub kind: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", post(create_job).get(list_jobs))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/logs", get(get_job_logs))
        // Legacy alias kept for older clients.
        .route("/build", post(create_job))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Validate the request, insert the pending row, then hand off to the
/// pipeline task and return the SSE stream immediately.
async fn create_job(
    State(state): State<SharedState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<Response, ApiError> {
    let prompt = match req.prompt {
        Some(p) if !p.trim().is_empty() => p,
        _ => return Err(ApiError::BadRequest("prompt is required".to_string())),
    };
    let model = req
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.config.default_model.clone());

    let job_id = new_job_id();
    let created_at = pipeline::now_rfc3339();
    {
        let id = job_id.clone();
        let prompt = prompt.clone();
        let model = model.clone();
        state
            .store
            .call(move |db| db.create_job(&id, &prompt, &model, &created_at))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    }

    let (events, rx) = EventSink::channel();
    pipeline::spawn_job(state.pipeline_deps(), job_id, prompt, model, events);

    let stream = UnboundedReceiverStream::new(rx).map(|event| Event::default().json_data(&event));
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(response)
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let jobs = state
        .store
        .call(move |db| db.list_jobs(limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "jobs": jobs })))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let job = state
        .store
        .call(move |db| db.get_job(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match job {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::NotFound(format!("Job {} not found", id))),
    }
}

/// Admin-gated retrieval of archived build/deploy logs.
async fn get_job_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let presented = headers
        .get("Auth")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented.is_empty() || presented != state.config.auth_token {
        return Err(ApiError::Unauthorized);
    }

    if query.kind != "build" && query.kind != "deploy" {
        return Err(ApiError::BadRequest(
            "type must be 'build' or 'deploy'".to_string(),
        ));
    }

    let lookup = id.clone();
    let keys = state
        .store
        .call(move |db| db.get_job_log_keys(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let Some((build_key, deploy_key)) = keys else {
        return Err(ApiError::NotFound(format!("Job {} not found", id)));
    };
    let key = if query.kind == "build" {
        build_key
    } else {
        deploy_key
    };
    let Some(key) = key else {
        return Err(ApiError::NotFound(format!(
            "No {} log for job {}",
            query.kind, id
        )));
    };

    let body = state
        .archive
        .get(&key)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match body {
        Some(text) => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response()),
        None => Err(ApiError::NotFound(format!(
            "No {} log for job {}",
            query.kind, id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_api_error_status_codes() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_api_error_body_is_structured() {
        let response = ApiError::BadRequest("prompt is required".into()).into_response();
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
    }
}
