//! rampart-rollout — release state machine, rollback, and orchestration.
//!
//! Each admitted release is driven by its own controller task through the
//! steps of its strategy (blue-green, canary, rolling, direct). Health
//! breaches and operator requests route to the rollback engine; every
//! transition is audited before it is committed.
//!
//! # Components
//!
//! - **`strategy`** — Rollout plans built from `rampart.toml`
//! - **`machine`** — Pure release state machine
//! - **`controller`** — Per-release actor (commands, observation, holds)
//! - **`rollback`** — Traffic revert, escalation, postmortem stubs
//! - **`audit`** — Append-only audit trail with unbounded retry
//! - **`readiness`** — Policy gate with durable waivers
//! - **`orchestrator`** — Public operations and admission

pub mod audit;
pub mod controller;
pub mod error;
pub mod events;
pub mod machine;
pub mod notify;
pub mod orchestrator;
pub mod readiness;
pub mod registry;
pub mod rollback;
pub mod strategy;
pub mod traffic;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

#[cfg(test)]
mod scenarios;

pub use audit::{AuditEvent, AuditRecorder, HEALTH_ACTOR, SYSTEM_ACTOR};
pub use controller::{ControllerContext, ReleaseController, ReleaseHandle};
pub use error::{RolloutError, RolloutResult};
pub use events::ProgressEvent;
pub use machine::{Action, HoldReason, ReleaseMachine};
pub use notify::{AlertLevel, LogNotifier, Notification, Notifier};
pub use orchestrator::{Collaborators, CreateReleaseRequest, ReleaseOrchestrator};
pub use readiness::{CheckSource, ReadinessGate};
pub use rollback::{RollbackEngine, RollbackResult};
pub use strategy::{PlanStep, RevertScope, RolloutPlan, RolloutSettings};
pub use traffic::{InMemoryRouter, TrafficRouter};
