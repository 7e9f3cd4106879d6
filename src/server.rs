//! Operator HTTP API.
//!
//! A small JSON API over the execution records, for dashboards and for
//! cancelling executions without shell access to the worker host.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (version, buffer depth) |
//! | `GET`  | `/executions?state=&limit=` | Executions, most recently updated first |
//! | `GET`  | `/executions/{id}` | One execution record |
//! | `POST` | `/executions/{id}/cancel?reason=` | Cancel a non-terminal execution |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "execution not found: l0-..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use level0_core::machine::{Execution, ExecutionState};
use level0_core::models::ExecutionId;
use level0_core::ports::ExecutionStore;

use crate::config::Config;
use crate::orchestrator::CancelOutcome;
use crate::pipeline::Pipeline;
use crate::status::DEFAULT_LIST_LIMIT;

/// Upper bound on `limit` for `GET /executions`.
const MAX_LIST_LIMIT: usize = 1000;

/// Open the pipeline from `config` and serve the API on `[server].bind`
/// until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Pipeline::open(config).await?;
    let listener = TcpListener::bind(&config.server.bind).await?;
    println!("Operator API listening on http://{}", listener.local_addr()?);
    serve_with_listener(pipeline, listener).await
}

/// Serve the API on an already bound listener.
pub async fn serve_with_listener(pipeline: Pipeline, listener: TcpListener) -> anyhow::Result<()> {
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

pub fn router(pipeline: Pipeline) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/executions", get(handle_list))
        .route("/executions/{id}", get(handle_get))
        .route("/executions/{id}/cancel", post(handle_cancel))
        .layer(cors)
        .with_state(pipeline)
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
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
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
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict",
        message: message.into(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    tracing::error!(error = %err, "operator api request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

fn parse_id(raw: &str) -> Result<ExecutionId, AppError> {
    ExecutionId::parse(raw).map_err(bad_request)
}

// ============ Views ============

/// An execution record plus the fields operators look for first.
#[derive(Serialize)]
struct ExecutionView {
    #[serde(flatten)]
    execution: Execution,
    attempt_count: u32,
    partial_success: bool,
}

impl From<Execution> for ExecutionView {
    fn from(execution: Execution) -> Self {
        Self {
            attempt_count: execution.attempt_count(),
            partial_success: execution.is_partial_success(),
            execution,
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    queued: i64,
    dead_letters: i64,
}

async fn handle_health(State(pipeline): State<Pipeline>) -> Result<Json<HealthResponse>, AppError> {
    let queued = pipeline.buffer.depth().await.map_err(internal)?;
    let dead_letters = pipeline.buffer.dead_letter_count().await.map_err(internal)?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queued,
        dead_letters,
    }))
}

// ============ GET /executions ============

#[derive(Deserialize)]
struct ListParams {
    state: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ListResponse {
    executions: Vec<ExecutionView>,
}

async fn handle_list(
    State(pipeline): State<Pipeline>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, AppError> {
    let state = match params.state.as_deref() {
        Some(raw) => Some(raw.parse::<ExecutionState>().map_err(bad_request)?),
        None => None,
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let executions = pipeline
        .executions
        .list(state, limit)
        .await
        .map_err(internal)?;
    Ok(Json(ListResponse {
        executions: executions.into_iter().map(ExecutionView::from).collect(),
    }))
}

// ============ GET /executions/{id} ============

async fn handle_get(
    State(pipeline): State<Pipeline>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionView>, AppError> {
    let id = parse_id(&id)?;
    let execution = pipeline
        .executions
        .load(&id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("execution not found: {}", id)))?;
    Ok(Json(execution.into()))
}

// ============ POST /executions/{id}/cancel ============

#[derive(Deserialize)]
struct CancelParams {
    reason: Option<String>,
}

async fn handle_cancel(
    State(pipeline): State<Pipeline>,
    Path(id): Path<String>,
    Query(params): Query<CancelParams>,
) -> Result<Json<ExecutionView>, AppError> {
    let id = parse_id(&id)?;
    let reason = params
        .reason
        .unwrap_or_else(|| "cancelled via operator api".to_string());
    match pipeline
        .orchestrator
        .cancel(&id, &reason)
        .await
        .map_err(internal)?
    {
        CancelOutcome::Cancelled(execution) => Ok(Json(execution.into())),
        CancelOutcome::AlreadyTerminal(execution) => Err(conflict(format!(
            "execution {} already finished ({})",
            execution.id, execution.state
        ))),
        CancelOutcome::NotFound => Err(not_found(format!("execution not found: {}", id))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use level0_core::models::FileDescriptor;

    #[test]
    fn test_view_flattens_record() {
        let descriptor = FileDescriptor::new("L0/2024-01-01/0ce86a42.ac1", "v1", Utc::now());
        let view = ExecutionView::from(Execution::new(descriptor, Utc::now()));
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["attempt_count"], 0);
        assert_eq!(json["partial_success"], false);
        assert!(json["id"].as_str().unwrap().starts_with("l0-"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(bad_request("x").status, StatusCode::BAD_REQUEST);
        assert_eq!(not_found("x").code, "not_found");
        assert_eq!(conflict("x").status, StatusCode::CONFLICT);
        assert!(parse_id("nope").is_err());
    }
}
