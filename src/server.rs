//! HTTP trigger surface.
//!
//! A thin JSON API over the [`Pipeline`] for operators and schedulers.
//! Runs execute inside the request and the response carries the final
//! [`MigrationResult`](crate::engine::MigrationResult).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health verdict (503 when the verdict is `error`) |
//! | `GET`  | `/plans` | Built-in migration plans with live estimates |
//! | `GET`  | `/scope` | Scope estimate |
//! | `POST` | `/runs/enhance` | Question enhancement, body `{"collection": "id"}` (optional) |
//! | `POST` | `/runs/migrate/{plan}` | Run a plan, body `{"backup_first": bool}` (optional) |
//! | `POST` | `/runs/cancel` | Cancel in-flight runs |
//!
//! # Admission
//!
//! `POST /runs/*` passes an inbound rate limiter keyed by the
//! `x-client-id` header (`anonymous` when absent). Denied requests get
//! `429 rate_limited`. A second concurrent run of the same operation gets
//! `409 run_in_progress`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "unknown migration plan: x" } }
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use course_harness_core::rate_limit::RateLimiter;

use crate::engine::MigrationResult;
use crate::error::PipelineError;
use crate::health::HealthStatus;
use crate::pipeline::Pipeline;
use crate::progress::NoProgress;

const CLIENT_HEADER: &str = "x-client-id";

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    admission: Arc<RateLimiter>,
    admission_limit: u32,
    admission_window: Duration,
    running: Arc<Mutex<HashSet<String>>>,
}

/// Build the router. Exposed separately from [`run_server`] for tests.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let server = &pipeline.config().server;
    let state = AppState {
        admission: Arc::new(RateLimiter::new()),
        admission_limit: server.admission_limit,
        admission_window: Duration::from_millis(server.admission_window_ms),
        running: Arc::new(Mutex::new(HashSet::new())),
        pipeline: pipeline.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/plans", get(handle_plans))
        .route("/scope", get(handle_scope))
        .route("/runs/enhance", post(handle_enhance))
        .route("/runs/migrate/{plan}", post(handle_migrate))
        .route("/runs/cancel", post(handle_cancel))
        .layer(cors)
        .with_state(state)
}

/// Bind to `[server].bind` and serve until Ctrl-C, which also cancels
/// in-flight runs.
pub async fn run_server(pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    let bind_addr = pipeline.config().server.bind.clone();
    let app = router(pipeline.clone());

    tracing::info!(bind = %bind_addr, "http server listening");
    println!("coursectl server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            pipeline.cancel();
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

struct AppError {
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

fn app_error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    app_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        format!("{:#}", err),
    )
}

fn classify_pipeline_error(err: PipelineError) -> AppError {
    let message = err.to_string();
    match err {
        PipelineError::Setup(ref m) if m.contains("not found") || m.starts_with("unknown") => {
            app_error(StatusCode::NOT_FOUND, "not_found", message)
        }
        PipelineError::Setup(_) => app_error(StatusCode::BAD_REQUEST, "bad_request", message),
        other => app_error(StatusCode::INTERNAL_SERVER_ERROR, other.code(), message),
    }
}

// ============ Admission ============

fn client_id(headers: &HeaderMap) -> String {
    headers
        .get(CLIENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

fn admit(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let client = client_id(headers);
    if state
        .admission
        .allow(&client, state.admission_limit, state.admission_window)
    {
        return Ok(());
    }
    let wait = state
        .admission
        .retry_after(&client)
        .map(|d| d.as_secs().max(1))
        .unwrap_or(1);
    tracing::warn!(client = %client, "run request rate limited");
    Err(app_error(
        StatusCode::TOO_MANY_REQUESTS,
        "rate_limited",
        format!("too many run requests, retry in {} s", wait),
    ))
}

/// Marks an operation as running until dropped.
struct RunGuard {
    running: Arc<Mutex<HashSet<String>>>,
    operation: String,
}

impl RunGuard {
    fn acquire(state: &AppState, operation: &str) -> Result<Self, AppError> {
        let mut running = state.running.lock().unwrap_or_else(|p| p.into_inner());
        if !running.insert(operation.to_string()) {
            return Err(app_error(
                StatusCode::CONFLICT,
                "run_in_progress",
                format!("{} is already running", operation),
            ));
        }
        Ok(Self {
            running: state.running.clone(),
            operation: operation.to_string(),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        running.remove(&self.operation);
    }
}

fn parse_body<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> Result<T, AppError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        app_error(
            StatusCode::BAD_REQUEST,
            "bad_request",
            format!("invalid JSON body: {}", e),
        )
    })
}

// ============ GET /health ============

async fn handle_health(State(state): State<AppState>) -> Response {
    let verdict = state.pipeline.run_health_check().await;
    let status = if verdict.status == HealthStatus::Error {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(verdict)).into_response()
}

// ============ GET /plans, GET /scope ============

async fn handle_plans(State(state): State<AppState>) -> Result<Response, AppError> {
    let plans = state.pipeline.list_plans().await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "plans": plans })).into_response())
}

async fn handle_scope(State(state): State<AppState>) -> Result<Response, AppError> {
    let scope = state.pipeline.estimate_scope().await.map_err(internal)?;
    Ok(Json(scope).into_response())
}

// ============ POST /runs/* ============

#[derive(Debug, Default, Deserialize)]
struct EnhanceRequest {
    #[serde(default)]
    collection: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MigrateRequest {
    #[serde(default = "default_backup_first")]
    backup_first: bool,
}

impl Default for MigrateRequest {
    fn default() -> Self {
        Self {
            backup_first: default_backup_first(),
        }
    }
}

fn default_backup_first() -> bool {
    true
}

async fn handle_enhance(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<MigrationResult>, AppError> {
    admit(&state, &headers)?;
    let request: EnhanceRequest = parse_body(&body)?;
    let operation = state.pipeline.config().enrichment.operation.clone();
    let _guard = RunGuard::acquire(&state, &operation)?;

    let result = state
        .pipeline
        .run_enhancement(request.collection.as_deref(), &NoProgress)
        .await
        .map_err(classify_pipeline_error)?;
    Ok(Json(result))
}

async fn handle_migrate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(plan): Path<String>,
    body: Bytes,
) -> Result<Json<MigrationResult>, AppError> {
    admit(&state, &headers)?;
    let request: MigrateRequest = parse_body(&body)?;
    let _guard = RunGuard::acquire(&state, &plan)?;

    let result = state
        .pipeline
        .run_migration(&plan, request.backup_first, &NoProgress)
        .await
        .map_err(classify_pipeline_error)?;
    Ok(Json(result))
}

async fn handle_cancel(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, AppError> {
    admit(&state, &headers)?;
    state.pipeline.cancel();
    Ok(StatusCode::ACCEPTED)
}
