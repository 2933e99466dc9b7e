//! Operator HTTP API.
//!
//! Read run history and class status, trigger manual runs, and query a
//! class index. Runs triggered here go through
//! [`RunScheduler::trigger_now`], the same locked path the timers use.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/runs?class=&limit=` | Run history, newest first |
//! | `GET`  | `/status` | Per-class lock, timer and last outcome |
//! | `POST` | `/classes/{class}/run` | Run now; body `{ "dry_run": bool, "full": bool }` |
//! | `POST` | `/classes/{class}/search` | Nearest neighbours; body `{ "query": str, "top_k": int }` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "locked", "message": "class 'sop' is already running (run ...)" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `locked` (409),
//! `aborted` (502), `internal` (500). An `aborted` error also carries the
//! finalized run under `error.run`.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use docsync_core::models::SearchHit;
use docsync_core::run::{PipelineRun, RunOutcome, Trigger};
use docsync_core::PipelineError;

use crate::ingest::{SyncOptions, SyncWindow};
use crate::scheduler::{ClassStatus, RunScheduler, TriggerError};

const DEFAULT_RUN_LIMIT: usize = 50;
const MAX_RUN_LIMIT: usize = 500;
const DEFAULT_TOP_K: usize = 10;
const MAX_TOP_K: usize = 100;

#[derive(Clone)]
struct AppState {
    scheduler: Arc<RunScheduler>,
}

pub fn router(scheduler: Arc<RunScheduler>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/runs", get(handle_runs))
        .route("/status", get(handle_status))
        .route("/classes/{class}/run", post(handle_run))
        .route("/classes/{class}/search", post(handle_search))
        .layer(cors)
        .with_state(AppState { scheduler })
}

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn run_server(
    bind: &str,
    scheduler: Arc<RunScheduler>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %bind, "operator API listening");
    axum::serve(listener, router(scheduler))
        .with_graceful_shutdown(shutdown)
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
    /// The finalized run, for runs that aborted.
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<Box<PipelineRun>>,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    run: Option<Box<PipelineRun>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                run: self.run,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
        run: None,
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
        run: None,
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
        run: None,
    }
}

impl From<TriggerError> for AppError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::Locked { .. } => AppError {
                status: StatusCode::CONFLICT,
                code: "locked",
                message: err.to_string(),
                run: None,
            },
            TriggerError::UnknownClass(_) => not_found(err.to_string()),
            TriggerError::RunLog(_) | TriggerError::Internal(_) => internal(err.to_string()),
            TriggerError::ZeroInterval(_) => bad_request(err.to_string()),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidDocument(message) => bad_request(message),
            other => internal(other.to_string()),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ GET /runs ============

#[derive(Deserialize)]
struct RunsQuery {
    class: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct RunsResponse {
    runs: Vec<PipelineRun>,
}

async fn handle_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<RunsResponse>, AppError> {
    if let Some(class) = &query.class {
        if state.scheduler.pipeline(class).is_none() {
            return Err(not_found(format!("unknown document class: '{}'", class)));
        }
    }
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    let runs = state
        .scheduler
        .run_log()
        .recent(query.class.as_deref(), limit)
        .await
        .map_err(|e| internal(format!("{:#}", e)))?;
    Ok(Json(RunsResponse { runs }))
}

// ============ GET /status ============

#[derive(Serialize)]
struct StatusResponse {
    classes: Vec<ClassStatusView>,
}

#[derive(Serialize)]
struct ClassStatusView {
    /// `idle` or `running`.
    state: &'static str,
    #[serde(flatten)]
    status: ClassStatus,
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let classes = state
        .scheduler
        .class_status()
        .await
        .map_err(|e| internal(format!("{:#}", e)))?
        .into_iter()
        .map(|status| ClassStatusView {
            state: if status.running.is_some() {
                "running"
            } else {
                "idle"
            },
            status,
        })
        .collect();
    Ok(Json(StatusResponse { classes }))
}

// ============ POST /classes/{class}/run ============

#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    full: bool,
}

/// An empty body means an incremental committed run.
async fn handle_run(
    State(state): State<AppState>,
    Path(class): Path<String>,
    body: Bytes,
) -> Result<Json<PipelineRun>, AppError> {
    let request: RunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid body: {}", e)))?
    };
    let options = SyncOptions {
        dry_run: request.dry_run,
        window: if request.full {
            SyncWindow::Full
        } else {
            SyncWindow::Checkpoint
        },
    };

    let run = state
        .scheduler
        .trigger_now(&class, Trigger::Manual, options)
        .await?;
    if run.outcome == RunOutcome::Aborted {
        return Err(AppError {
            status: StatusCode::BAD_GATEWAY,
            code: "aborted",
            message: format!(
                "run {} aborted: {}",
                run.id,
                run.abort_reason.as_deref().unwrap_or("unknown reason")
            ),
            run: Some(Box::new(run)),
        });
    }
    Ok(Json(run))
}

// ============ POST /classes/{class}/search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    class: String,
    hits: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let pipeline = state
        .scheduler
        .pipeline(&class)
        .ok_or_else(|| not_found(format!("unknown document class: '{}'", class)))?;
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let top_k = request.top_k.unwrap_or(DEFAULT_TOP_K).clamp(1, MAX_TOP_K);
    let hits = pipeline.search(&request.query, top_k).await?;
    Ok(Json(SearchResponse { class, hits }))
}
