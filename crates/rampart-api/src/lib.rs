//! rampart-api — REST API for Rampart.
//!
//! Thin axum layer over [`ReleaseOrchestrator`]. Every response uses the
//! `{success, data, error}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/releases` | List releases, newest first |
//! | POST | `/api/v1/releases` | Create a release (readiness-gated) |
//! | GET | `/api/v1/releases/{id}` | Release status |
//! | POST | `/api/v1/releases/{id}/promote` | Advance a manual canary |
//! | POST | `/api/v1/releases/{id}/pause` | Pause a running release |
//! | POST | `/api/v1/releases/{id}/resume` | Resume a paused release |
//! | POST | `/api/v1/releases/{id}/rollback` | Roll back, idempotent |
//! | GET | `/api/v1/releases/{id}/audit` | Audit trail in sequence order |
//! | GET | `/api/v1/projects/{project}/readiness` | Last readiness report |
//! | POST | `/api/v1/projects/{project}/readiness` | Evaluate supplied check results |
//! | POST | `/api/v1/projects/{project}/waivers` | Waive a failing check |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use rampart_rollout::ReleaseOrchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<ReleaseOrchestrator>,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Arc<ReleaseOrchestrator>) -> Router {
    let state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/releases", get(handlers::list_releases).post(handlers::create_release))
        .route("/releases/{id}", get(handlers::get_release))
        .route("/releases/{id}/promote", post(handlers::promote_release))
        .route("/releases/{id}/pause", post(handlers::pause_release))
        .route("/releases/{id}/resume", post(handlers::resume_release))
        .route("/releases/{id}/rollback", post(handlers::rollback_release))
        .route("/releases/{id}/audit", get(handlers::get_audit_trail))
        .route(
            "/projects/{project}/readiness",
            get(handlers::get_readiness).post(handlers::evaluate_readiness),
        )
        .route("/projects/{project}/waivers", post(handlers::waive_check))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
