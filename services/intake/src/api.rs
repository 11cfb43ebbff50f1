use crate::config::ApiConfig;
use crate::coordinator::SubmissionCoordinator;
use crate::error::IntakeError;
use crate::health::{run_checks, DependencyCheck, HealthSnapshot, ServiceHealth};
use crate::ingress::{SessionSnapshot, SessionStatus};
use crate::ledger::{StatusCount, SubmissionLedger, SubmissionQuery};
use crate::submission::{ProcessingResult, Submission, SubmissionStatus};
use crate::transfer::VideoStorage;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: SubmissionCoordinator,
    pub storage: Arc<dyn VideoStorage>,
    pub session: SessionStatus,
    pub health: Arc<ServiceHealth>,
    pub service_name: String,
    pub health_check_timeout: Duration,
}

impl AppState {
    fn ledger(&self) -> &Arc<dyn SubmissionLedger> {
        self.coordinator.ledger()
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

impl From<IntakeError> for ApiError {
    fn from(err: IntakeError) -> Self {
        match err {
            IntakeError::NotFound(id) => api_error(
                StatusCode::NOT_FOUND,
                format!("Submission {} not found", id),
                "NOT_FOUND",
            ),
            e @ IntakeError::InvalidTransition { .. } => {
                api_error(StatusCode::CONFLICT, e.to_string(), "INVALID_TRANSITION")
            }
            e => {
                error!(error = %e, "Request failed");
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error",
                    "INTERNAL_ERROR",
                )
            }
        }
    }
}

/// Query parameters for submission list
#[derive(Debug, Deserialize)]
pub struct SubmissionListQuery {
    pub status: Option<String>,
    pub volunteer_id: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct SubmissionListResponse {
    pub submissions: Vec<Submission>,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub by_status: Vec<StatusCount>,
    pub total: i64,
    pub health: HealthSnapshot,
}

/// `/status` body
#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub session: SessionSnapshot,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/status", get(session_status))
        .route("/version", get(version))
        .route("/api/v1/submissions", get(list_submissions))
        .route("/api/v1/submissions/:submission_id", get(get_submission))
        .route(
            "/api/v1/submissions/:submission_id/result",
            post(submit_result),
        )
        .route("/api/v1/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "message": format!("{} is running", state.service_name)
    }))
}

/// Probe every dependency; 503 when any of them fails
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.session.clone();
    let storage = state.storage.clone();
    let ledger = state.ledger().clone();

    let checks = vec![
        DependencyCheck::new("session", async move { session.check() }.boxed()),
        DependencyCheck::new("storage", async move { storage.check().await }.boxed()),
        DependencyCheck::new("ledger", async move { ledger.check().await }.boxed()),
    ];
    let results = run_checks(checks, state.health_check_timeout).await;
    let pipeline = state.health.snapshot();

    let (code, status) = if results.iter().any(|r| !r.healthy) {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if pipeline.degraded {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "service": state.service_name,
            "checks": results,
            "pipeline": pipeline,
        })),
    )
}

async fn session_status(State(state): State<AppState>) -> Json<SessionStatusResponse> {
    let session = state.session.snapshot();
    let status = if state.session.is_connected() {
        "connected"
    } else {
        "disconnected"
    };
    Json(SessionStatusResponse { status, session })
}

async fn version(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "git_sha": option_env!("INTAKE_GIT_SHA").unwrap_or("unknown"),
        "profile": if cfg!(debug_assertions) { "debug" } else { "release" },
    }))
}

#[instrument(skip(state))]
async fn list_submissions(
    State(state): State<AppState>,
    Query(params): Query<SubmissionListQuery>,
) -> Result<Json<SubmissionListResponse>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<SubmissionStatus>)
        .transpose()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e, "INVALID_STATUS"))?;
    let limit = params.limit.clamp(1, 500);

    let mut submissions = state
        .ledger()
        .list(&SubmissionQuery {
            status,
            volunteer_id: params.volunteer_id,
            // One extra to detect another page
            limit: Some(limit + 1),
            offset: Some(params.offset.max(0)),
        })
        .await?;

    let has_more = submissions.len() > limit as usize;
    if has_more {
        submissions.pop();
    }

    Ok(Json(SubmissionListResponse {
        submissions,
        has_more,
    }))
}

#[instrument(skip(state))]
async fn get_submission(
    State(state): State<AppState>,
    Path(submission_id): Path<Uuid>,
) -> Result<Json<Submission>, ApiError> {
    Ok(Json(state.ledger().get(submission_id).await?))
}

/// Pipeline callback with the processing outcome
#[instrument(skip(state, result))]
async fn submit_result(
    State(state): State<AppState>,
    Path(submission_id): Path<Uuid>,
    Json(result): Json<ProcessingResult>,
) -> Result<Json<Submission>, ApiError> {
    if result.submission_id != submission_id {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "submission_id in body does not match path",
            "ID_MISMATCH",
        ));
    }

    let updated = state
        .coordinator
        .apply_result(submission_id, result)
        .await?;
    Ok(Json(updated))
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let by_status = state.ledger().count_by_status().await?;
    let total = by_status.iter().map(|c| c.count).sum();

    Ok(Json(StatsResponse {
        by_status,
        total,
        health: state.health.snapshot(),
    }))
}

/// Start the HTTP API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
