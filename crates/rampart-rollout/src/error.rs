//! Rollout error types.

use std::time::Duration;

use rampart_state::ReleaseStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    /// Readiness checks failing. Each detail names the check and its
    /// remediation link.
    #[error("release blocked by policy for {project}: {}", details.join("; "))]
    PolicyBlocked {
        project: String,
        blockers: Vec<String>,
        details: Vec<String>,
    },

    #[error("release {release_id} is already active for {project}/{environment}")]
    ActiveReleaseExists {
        project: String,
        environment: String,
        release_id: String,
    },

    #[error("release not found: {0}")]
    ReleaseNotFound(String),

    #[error("cannot {command} release {release_id} while {status}")]
    InvalidTransition {
        release_id: String,
        command: String,
        status: ReleaseStatus,
    },

    #[error("stage {stage} failed: {message}")]
    TransientInfra { stage: String, message: String },

    #[error("rollback of {release_id} not confirmed within {timeout:?}; escalated")]
    RollbackTimeout { release_id: String, timeout: Duration },

    #[error("audit write failed: {0}")]
    AuditWriteFailure(String),

    #[error("controller for release {0} is no longer running")]
    ControllerGone(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Policy(#[from] rampart_policy::PolicyError),

    #[error(transparent)]
    Scheduler(#[from] rampart_scheduler::SchedulerError),

    #[error(transparent)]
    Health(#[from] rampart_health::HealthError),

    #[error("state store error: {0}")]
    State(#[from] rampart_state::StateError),

    #[error(transparent)]
    Config(#[from] rampart_core::ConfigError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
