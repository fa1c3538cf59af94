use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use submit_core::TaskId;
use submit_db::{RetryPolicy, StoreError};

use crate::state::AppState;

const DEFAULT_RECENT_LIMIT: u64 = 20;
const MAX_RECENT_LIMIT: u64 = 100;

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

fn store_error(e: StoreError) -> Response {
    let code = match &e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidTransition { .. } | StoreError::AttemptsExhausted { .. } => {
            StatusCode::CONFLICT
        }
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Corrupt { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if code.is_server_error() {
        tracing::error!(error = %e, "store request failed");
    }
    json_error(code, e.to_string())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/recent", get(recent_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/retry", post(retry_task))
        .route("/api/queue", get(queue))
        .with_state(state)
}

/// Accepts only absolute http(s) URLs whose path names a `.zip` archive.
pub(crate) fn validate_input_url(raw: &str) -> Result<String, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("input_url is required".to_string());
    }
    let url = reqwest::Url::parse(raw).map_err(|e| format!("input_url is not a valid URL: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err("input_url must use http or https".to_string());
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err("input_url has no host".to_string());
    }
    if !url.path().to_ascii_lowercase().ends_with(".zip") {
        return Err("input_url must point to a .zip archive".to_string());
    }
    Ok(raw.to_string())
}

pub(crate) fn clamp_limit(limit: Option<i64>) -> u64 {
    match limit {
        None => DEFAULT_RECENT_LIMIT,
        Some(n) => n.clamp(1, MAX_RECENT_LIMIT as i64) as u64,
    }
}

fn parse_task_id(raw: &str) -> Result<TaskId, Response> {
    raw.parse::<TaskId>()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, format!("invalid task id {raw:?}")))
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    queue_length: i64,
    total: i64,
}

async fn healthz(State(state): State<AppState>) -> Response {
    match state.store.queue_summary().await {
        Ok(summary) => Json(HealthzResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            queue_length: summary.queue_length,
            total: summary.total,
        })
        .into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub input_url: String,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(input): Json<CreateTaskRequest>,
) -> Response {
    let url = match validate_input_url(&input.input_url) {
        Ok(u) => u,
        Err(msg) => return json_error(StatusCode::BAD_REQUEST, msg),
    };
    let task = match state.store.create(&url).await {
        Ok(t) => t,
        Err(e) => return store_error(e),
    };
    tracing::info!(task_id = %task.id, url = %task.input_url, "task created");
    state.notifier.notify_created(&task).await;
    (StatusCode::CREATED, Json(task)).into_response()
}

pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.get(id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub policy: RetryPolicy,
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RetryRequest>>,
) -> Response {
    let id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let policy = body.map(|Json(b)| b.policy).unwrap_or_default();
    match state.store.retry(id, policy).await {
        Ok(task) => {
            tracing::info!(task_id = %id, ?policy, attempts = task.attempts, "task queued for retry");
            Json(task).into_response()
        }
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

pub async fn recent_tasks(State(state): State<AppState>, Query(q): Query<RecentQuery>) -> Response {
    match state.store.list_recent(clamp_limit(q.limit)).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => store_error(e),
    }
}

pub async fn queue(State(state): State<AppState>) -> Response {
    match state.store.queue_summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => store_error(e),
    }
}
