//! Scheduler error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a stage operation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StageError {
    /// Rate limits, timeouts, unavailable collaborators. Retried.
    #[error("transient: {0}")]
    Transient(String),

    /// Validation or policy failures. Never retried.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        StageError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        StageError::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("duplicate stage: {0}")]
    DuplicateStage(String),

    #[error("stage {stage} depends on unknown stage {dependency}")]
    UnknownDependency { stage: String, dependency: String },

    #[error("dependency cycle through stages: {0}")]
    Cycle(String),

    #[error("no operation registered for stage {stage} in scope {scope}")]
    UnknownStage { scope: String, stage: String },

    #[error("stage task failed: {0}")]
    Task(String),

    #[error("state store error: {0}")]
    State(#[from] rampart_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
