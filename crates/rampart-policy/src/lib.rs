//! rampart-policy — Readiness gating for releases.
//!
//! Evaluates supplied check results (coverage, vulnerability counts,
//! performance, cost delta, compliance) against the configured checks and
//! produces a [`ReadinessReport`]. Failing checks can be waived for a
//! bounded time unless they are marked non-waivable.
//!
//! Also scores release risk from strategy, environment, and time of day.

pub mod check;
pub mod error;
pub mod evaluator;
pub mod risk;

pub use check::{
    COMPLIANCE_CHECK, COST_BUDGET, Category, CheckResult, Measurement, PERFORMANCE_BUDGET,
    PolicyCheck, Rule, SECURITY_SCAN, Severity, TEST_COVERAGE, default_checks,
};
pub use error::{PolicyError, PolicyResult};
pub use evaluator::{CheckReport, CheckStatus, PolicyEvaluator, ReadinessReport};
pub use risk::{
    RiskAssessment, RiskLevel, assess, hour_of_day_utc, risk_score, suggest_strategy,
};
