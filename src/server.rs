//! HTTP API for enqueueing, inspecting, and restarting jobs.
//!
//! Also receives out-of-band completion callbacks from asynchronous
//! providers. Workers are separate processes (`docflow work`); the server
//! only reads and writes the shared job store.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/jobs` | List jobs (`status`, `batch_id`, `limit` query params) |
//! | `POST` | `/jobs` | Enqueue a job |
//! | `GET`  | `/jobs/counters` | Job counts per status |
//! | `GET`  | `/jobs/{id}` | Full job record with steps, logs, and trace |
//! | `POST` | `/jobs/{id}/start` | Requeue a job, subject to the dispatch window (`?force=true` bypasses it) |
//! | `POST` | `/jobs/{id}/callback` | Provider callback, `Authorization: Bearer <secret>` |
//! | `POST` | `/jobs/restart` | Bulk restart, requires `"confirm": true` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "already_started", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `validation` (400), `unauthorized` (401),
//! `not_found` (404), `already_started` (409), `transient_provider` (503),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use docflow_core::error::{error_code, PipelineError};
use docflow_core::models::{Job, JobStatus, NewJob};
use docflow_core::startability::{self, Startability};

use crate::callback::{CallbackChannel, CallbackPayload};
use crate::config::Config;
use crate::db;
use crate::queue::{Counters, JobFilter, JobQueue, QueueOptions};
use crate::restart::{bulk_restart, BulkRestartReport, BulkRestartRequest};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    queue: JobQueue,
    callbacks: CallbackChannel,
}

impl AppState {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            callbacks: CallbackChannel::new(queue.clone()),
            queue,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/jobs", get(handle_list_jobs).post(handle_enqueue))
        .route("/jobs/counters", get(handle_counters))
        .route("/jobs/restart", post(handle_bulk_restart))
        .route("/jobs/{id}", get(handle_get_job))
        .route("/jobs/{id}/start", post(handle_start))
        .route("/jobs/{id}/callback", post(handle_callback))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on `[server].bind`.
pub async fn run_server(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let queue = JobQueue::new(pool, QueueOptions::from_config(config));
    let app = router(AppState::new(queue));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let code = error_code(&err);
        let status = match code {
            "bad_request" | "validation" | "invalid_transition" => StatusCode::BAD_REQUEST,
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "not_found" => StatusCode::NOT_FOUND,
            "already_started" => StatusCode::CONFLICT,
            "transient_provider" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: code.to_string(),
            message: format!("{:#}", err),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        anyhow::Error::from(err).into()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /jobs ============

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    batch_id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn handle_list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Job>>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|e| bad_request(e.to_string()))?;
    let jobs = state
        .queue
        .list(&JobFilter {
            status,
            batch_id: params.batch_id,
            limit: Some(params.limit.unwrap_or(100).clamp(1, 1000)),
            ..Default::default()
        })
        .await?;
    Ok(Json(jobs))
}

async fn handle_enqueue(
    State(state): State<AppState>,
    body: Result<Json<NewJob>, JsonRejection>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let Json(new_job) = body?;
    let job = state.queue.enqueue(new_job).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn handle_counters(State(state): State<AppState>) -> Result<Json<Counters>, AppError> {
    Ok(Json(state.queue.counters().await?))
}

async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let job = state
        .queue
        .get(&id)
        .await?
        .ok_or_else(|| not_found(format!("no job with id: {}", id)))?;
    Ok(Json(job))
}

// ============ POST /jobs/{id}/start ============

#[derive(Debug, Default, Deserialize)]
struct StartParams {
    #[serde(default)]
    force: bool,
}

/// Requeue a job unless a provider call it dispatched is still in flight.
async fn handle_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<StartParams>,
) -> Result<Json<Job>, AppError> {
    let job = state
        .queue
        .get(&id)
        .await?
        .ok_or_else(|| not_found(format!("no job with id: {}", id)))?;
    let now = Utc::now();

    let live_lease = job.status == JobStatus::Running
        && job.lease().is_some_and(|l| !l.is_stale(now, state.queue.stale_ms()));
    if live_lease && !params.force {
        return Err(PipelineError::AlreadyInProgress {
            job_id: id,
            acknowledged_at: job.heartbeat_at.unwrap_or(now),
        }
        .into());
    }

    if let Startability::AlreadyStarted { acknowledged_at } = startability::can_start(&job, now) {
        if !params.force && !startability::bypasses_window(&job) {
            return Err(PipelineError::AlreadyInProgress {
                job_id: id,
                acknowledged_at,
            }
            .into());
        }
    }

    let job = state.queue.restart(&id).await?;
    Ok(Json(job))
}

// ============ POST /jobs/{id}/callback ============

#[derive(Serialize)]
struct CallbackAck {
    status: &'static str,
}

async fn handle_callback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<CallbackPayload>, JsonRejection>,
) -> Result<Json<CallbackAck>, AppError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| unauthorized("missing bearer token"))?;
    let Json(payload) = body?;

    state.callbacks.deliver(&id, bearer, &payload).await?;
    Ok(Json(CallbackAck { status: "accepted" }))
}

// ============ POST /jobs/restart ============

async fn handle_bulk_restart(
    State(state): State<AppState>,
    body: Result<Json<BulkRestartRequest>, JsonRejection>,
) -> Result<Json<BulkRestartReport>, AppError> {
    let Json(request) = body?;
    Ok(Json(bulk_restart(&state.queue, &request).await?))
}
