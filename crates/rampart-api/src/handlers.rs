//! REST API handlers.
//!
//! Each handler calls one orchestrator operation and maps its error onto
//! an HTTP status.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rampart_policy::{CheckResult, PolicyError};
use rampart_rollout::{CreateReleaseRequest, RolloutError};
use tracing::{error, info};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// HTTP status for an orchestrator error.
pub fn status_for(err: &RolloutError) -> StatusCode {
    match err {
        RolloutError::ReleaseNotFound(_) => StatusCode::NOT_FOUND,
        RolloutError::ActiveReleaseExists { .. } | RolloutError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        RolloutError::PolicyBlocked { .. } | RolloutError::InvalidRequest(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        RolloutError::Policy(PolicyError::UnknownCheck(_)) => StatusCode::NOT_FOUND,
        RolloutError::Policy(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RolloutError::RollbackTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RolloutError::TransientInfra { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: RolloutError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, %status, "request failed");
    }
    error_response(&err.to_string(), status)
}

fn default_actor() -> String {
    "api".to_string()
}

/// Body for promote, pause, and resume.
#[derive(Debug, serde::Deserialize)]
pub struct CommandRequest {
    #[serde(default = "default_actor")]
    pub actor: String,
}

/// Body for a rollback request.
#[derive(Debug, serde::Deserialize)]
pub struct RollbackRequest {
    #[serde(default = "default_actor")]
    pub actor: String,
    pub reason: String,
}

#[derive(Debug, serde::Deserialize)]
pub struct EvaluateRequest {
    pub results: Vec<CheckResult>,
}

#[derive(Debug, serde::Deserialize)]
pub struct WaiverRequest {
    pub check: String,
    pub reason: String,
    pub waived_by: String,
    /// Unix timestamp (millis) after which the waiver lapses.
    pub expires_at: u64,
}

// ── Releases ───────────────────────────────────────────────────

/// GET /api/v1/releases
pub async fn list_releases(State(state): State<ApiState>) -> Response {
    match state.orchestrator.list_releases().await {
        Ok(releases) => ApiResponse::ok(releases).into_response(),
        Err(e) => failure(e),
    }
}

/// POST /api/v1/releases
pub async fn create_release(
    State(state): State<ApiState>,
    Json(req): Json<CreateReleaseRequest>,
) -> Response {
    match state.orchestrator.create_release(req).await {
        Ok(release) => {
            info!(release_id = %release.id, "release created via api");
            (StatusCode::CREATED, ApiResponse::ok(release)).into_response()
        }
        Err(e) => failure(e),
    }
}

/// GET /api/v1/releases/{id}
pub async fn get_release(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.get_release_status(&id).await {
        Ok(release) => ApiResponse::ok(release).into_response(),
        Err(e) => failure(e),
    }
}

/// POST /api/v1/releases/{id}/promote
pub async fn promote_release(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Response {
    match state.orchestrator.promote(&id, &req.actor).await {
        Ok(release) => ApiResponse::ok(release).into_response(),
        Err(e) => failure(e),
    }
}

/// POST /api/v1/releases/{id}/pause
pub async fn pause_release(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Response {
    match state.orchestrator.pause(&id, &req.actor).await {
        Ok(release) => ApiResponse::ok(release).into_response(),
        Err(e) => failure(e),
    }
}

/// POST /api/v1/releases/{id}/resume
pub async fn resume_release(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Response {
    match state.orchestrator.resume(&id, &req.actor).await {
        Ok(release) => ApiResponse::ok(release).into_response(),
        Err(e) => failure(e),
    }
}

/// POST /api/v1/releases/{id}/rollback
///
/// Blocks until the rollback is confirmed or escalated. Repeating the
/// call on a rolled-back release returns the original result.
pub async fn rollback_release(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> Response {
    if req.reason.trim().is_empty() {
        return error_response("rollback reason is required", StatusCode::UNPROCESSABLE_ENTITY);
    }
    match state.orchestrator.rollback(&id, &req.actor, &req.reason).await {
        Ok(result) => ApiResponse::ok(result).into_response(),
        Err(e) => failure(e),
    }
}

/// GET /api/v1/releases/{id}/audit
pub async fn get_audit_trail(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.audit_trail(&id).await {
        Ok(entries) => ApiResponse::ok(entries).into_response(),
        Err(e) => failure(e),
    }
}

// ── Readiness ──────────────────────────────────────────────────

/// GET /api/v1/projects/{project}/readiness
pub async fn get_readiness(
    State(state): State<ApiState>,
    Path(project): Path<String>,
) -> Response {
    match state.orchestrator.get_readiness(&project).await {
        Ok(Some(report)) => ApiResponse::ok(report).into_response(),
        Ok(None) => error_response("project has not been evaluated", StatusCode::NOT_FOUND),
        Err(e) => failure(e),
    }
}

/// POST /api/v1/projects/{project}/readiness
pub async fn evaluate_readiness(
    State(state): State<ApiState>,
    Path(project): Path<String>,
    Json(req): Json<EvaluateRequest>,
) -> Response {
    match state.orchestrator.evaluate_readiness(&project, &req.results).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => failure(e),
    }
}

/// POST /api/v1/projects/{project}/waivers
pub async fn waive_check(
    State(state): State<ApiState>,
    Path(project): Path<String>,
    Json(req): Json<WaiverRequest>,
) -> Response {
    match state
        .orchestrator
        .waive_policy_check(&project, &req.check, &req.reason, &req.waived_by, req.expires_at)
        .await
    {
        Ok(waiver) => (StatusCode::CREATED, ApiResponse::ok(waiver)).into_response(),
        Err(e) => failure(e),
    }
}
