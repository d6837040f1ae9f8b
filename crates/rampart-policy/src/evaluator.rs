//! Readiness evaluation and waivers.
//!
//! The evaluator is pure: it owns the configured checks, the known
//! waivers, and the last results per project. Persisting waivers and
//! auditing reports is the caller's job.

use std::collections::HashMap;

use rampart_state::WaiverRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::check::{Category, CheckResult, PolicyCheck, Severity};
use crate::error::{PolicyError, PolicyResult};

/// Outcome of one check in one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    Waived { reason: String, expires_at: u64 },
}

impl CheckStatus {
    /// Whether the status blocks a release at `now`. A lapsed waiver blocks.
    pub fn is_blocking(&self, now_ms: u64) -> bool {
        match self {
            CheckStatus::Passed => false,
            CheckStatus::Failed => true,
            CheckStatus::Waived { expires_at, .. } => now_ms >= *expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub name: String,
    pub category: Category,
    pub severity: Severity,
    pub waivable: bool,
    #[serde(flatten)]
    pub status: CheckStatus,
    pub message: String,
    /// Set for failing and waived checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub project: String,
    pub ready: bool,
    /// Passed checks as a percentage of all evaluated checks.
    pub score: f64,
    pub checks: Vec<CheckReport>,
    pub blockers: Vec<String>,
    pub waived: Vec<String>,
    pub evaluated_at: u64,
}

impl ReadinessReport {
    pub fn check(&self, name: &str) -> Option<&CheckReport> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// "name: message (remediation)" for every blocker.
    pub fn blocker_details(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| self.blockers.contains(&c.name))
            .map(|c| match &c.remediation_url {
                Some(url) => format!("{}: {} (see {url})", c.name, c.message),
                None => format!("{}: {}", c.name, c.message),
            })
            .collect()
    }
}

pub struct PolicyEvaluator {
    checks: Vec<PolicyCheck>,
    /// (project, check) → waiver.
    waivers: HashMap<(String, String), WaiverRecord>,
    last_results: HashMap<String, Vec<CheckResult>>,
    last_reports: HashMap<String, ReadinessReport>,
}

impl PolicyEvaluator {
    pub fn new(checks: Vec<PolicyCheck>) -> Self {
        Self {
            checks,
            waivers: HashMap::new(),
            last_results: HashMap::new(),
            last_reports: HashMap::new(),
        }
    }

    pub fn checks(&self) -> &[PolicyCheck] {
        &self.checks
    }

    /// Register a waiver loaded from durable storage.
    pub fn restore_waiver(&mut self, waiver: WaiverRecord) {
        self.waivers
            .insert((waiver.project.clone(), waiver.check_name.clone()), waiver);
    }

    pub fn last_report(&self, project: &str) -> Option<&ReadinessReport> {
        self.last_reports.get(project)
    }

    /// Evaluate every configured check against the supplied results.
    ///
    /// A configured check with no result is blocked. Results for unknown
    /// checks are ignored.
    pub fn evaluate(&mut self, project: &str, results: &[CheckResult], now_ms: u64) -> ReadinessReport {
        let report = self.derive(project, results, now_ms);
        info!(
            project,
            ready = report.ready,
            score = report.score,
            blockers = ?report.blockers,
            "readiness evaluated"
        );
        self.last_results.insert(project.to_string(), results.to_vec());
        self.last_reports.insert(project.to_string(), report.clone());
        report
    }

    /// Re-derive the last report for `project` at `now_ms` from the results
    /// it was evaluated with, so expired waivers block again.
    pub fn reevaluate(&mut self, project: &str, now_ms: u64) -> Option<ReadinessReport> {
        let results = self.last_results.get(project)?.clone();
        let report = self.derive(project, &results, now_ms);
        self.last_reports.insert(project.to_string(), report.clone());
        Some(report)
    }

    /// Waive a failing check until `expires_at`.
    ///
    /// The last report for the project is re-derived so its `ready` flag
    /// reflects the waiver immediately.
    pub fn waive(
        &mut self,
        project: &str,
        check_name: &str,
        reason: &str,
        waived_by: &str,
        expires_at: u64,
        now_ms: u64,
    ) -> PolicyResult<WaiverRecord> {
        let check = self
            .checks
            .iter()
            .find(|c| c.name == check_name)
            .ok_or_else(|| PolicyError::UnknownCheck(check_name.to_string()))?;
        if !check.waivable {
            return Err(PolicyError::NotWaivable(check_name.to_string()));
        }
        let failing = self
            .last_reports
            .get(project)
            .and_then(|r| r.check(check_name))
            .is_some_and(|c| !matches!(c.status, CheckStatus::Passed));
        if !failing {
            return Err(PolicyError::AlreadyPassing {
                project: project.to_string(),
                check: check_name.to_string(),
            });
        }
        if expires_at <= now_ms {
            return Err(PolicyError::InvalidExpiry { expires_at, now: now_ms });
        }

        let waiver = WaiverRecord {
            project: project.to_string(),
            check_name: check_name.to_string(),
            reason: reason.to_string(),
            waived_by: waived_by.to_string(),
            expires_at,
            created_at: now_ms,
        };
        self.restore_waiver(waiver.clone());
        info!(project, check = check_name, expires_at, "policy check waived");

        if let Some(results) = self.last_results.get(project).cloned() {
            let report = self.derive(project, &results, now_ms);
            self.last_reports.insert(project.to_string(), report);
        }
        Ok(waiver)
    }

    fn derive(&self, project: &str, results: &[CheckResult], now_ms: u64) -> ReadinessReport {
        let mut checks = Vec::with_capacity(self.checks.len());
        let mut blockers = Vec::new();
        let mut waived = Vec::new();
        let mut passed = 0usize;

        for check in &self.checks {
            let verdict = results
                .iter()
                .find(|r| r.check == check.name)
                .map(|r| check.rule.apply(&r.measurement));
            let (ok, message) = match verdict {
                Some(v) => (v.passed, v.message),
                None => (false, "no result supplied".to_string()),
            };

            let status = if ok {
                passed += 1;
                CheckStatus::Passed
            } else {
                match self.active_waiver(project, &check.name, now_ms) {
                    Some(w) => {
                        waived.push(check.name.clone());
                        CheckStatus::Waived {
                            reason: w.reason.clone(),
                            expires_at: w.expires_at,
                        }
                    }
                    None => {
                        blockers.push(check.name.clone());
                        CheckStatus::Failed
                    }
                }
            };
            debug!(project, check = %check.name, ?status, "check evaluated");

            checks.push(CheckReport {
                name: check.name.clone(),
                category: check.category,
                severity: check.severity,
                waivable: check.waivable,
                remediation_url: (!ok).then(|| check.remediation_url.clone()),
                status,
                message,
            });
        }

        let score = if checks.is_empty() {
            100.0
        } else {
            passed as f64 / checks.len() as f64 * 100.0
        };

        ReadinessReport {
            project: project.to_string(),
            ready: blockers.is_empty(),
            score,
            checks,
            blockers,
            waived,
            evaluated_at: now_ms,
        }
    }

    fn active_waiver(&self, project: &str, check: &str, now_ms: u64) -> Option<&WaiverRecord> {
        self.waivers
            .get(&(project.to_string(), check.to_string()))
            .filter(|w| w.is_active(now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::*;
    use rampart_core::PolicySection;

    const NOW: u64 = 1_700_000_000_000;
    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    fn evaluator() -> PolicyEvaluator {
        PolicyEvaluator::new(default_checks(&PolicySection::default()))
    }

    fn passing_results() -> Vec<CheckResult> {
        vec![
            CheckResult::new(TEST_COVERAGE, Measurement::Coverage { percent: 91.0 }),
            CheckResult::new(
                SECURITY_SCAN,
                Measurement::Vulnerabilities { critical: 0, high: 1, medium: 4, low: 10 },
            ),
            CheckResult::new(
                PERFORMANCE_BUDGET,
                Measurement::Performance { p95_ms: 320.0, error_rate_percent: 0.2 },
            ),
            CheckResult::new(COST_BUDGET, Measurement::CostDelta { percent: 4.0 }),
            CheckResult::new(COMPLIANCE_CHECK, Measurement::Compliance { failed_controls: vec![] }),
        ]
    }

    fn with(results: Vec<CheckResult>, replacement: CheckResult) -> Vec<CheckResult> {
        results
            .into_iter()
            .map(|r| if r.check == replacement.check { replacement.clone() } else { r })
            .collect()
    }

    #[test]
    fn all_passing_is_ready() {
        let mut eval = evaluator();
        let report = eval.evaluate("shop", &passing_results(), NOW);
        assert!(report.ready);
        assert_eq!(report.score, 100.0);
        assert!(report.blockers.is_empty());
        assert!(report.checks.iter().all(|c| c.remediation_url.is_none()));
    }

    #[test]
    fn low_coverage_blocks_with_remediation() {
        let mut eval = evaluator();
        let results = with(
            passing_results(),
            CheckResult::new(TEST_COVERAGE, Measurement::Coverage { percent: 72.0 }),
        );
        let report = eval.evaluate("shop", &results, NOW);

        assert!(!report.ready);
        assert_eq!(report.blockers, vec![TEST_COVERAGE.to_string()]);
        assert_eq!(report.score, 80.0);
        let coverage = report.check(TEST_COVERAGE).unwrap();
        assert_eq!(coverage.status, CheckStatus::Failed);
        assert!(coverage.remediation_url.is_some());
        assert_eq!(report.blocker_details().len(), 1);
    }

    #[test]
    fn missing_result_blocks() {
        let mut eval = evaluator();
        let results: Vec<_> = passing_results()
            .into_iter()
            .filter(|r| r.check != COST_BUDGET)
            .collect();
        let report = eval.evaluate("shop", &results, NOW);
        assert_eq!(report.blockers, vec![COST_BUDGET.to_string()]);
        assert_eq!(report.check(COST_BUDGET).unwrap().message, "no result supplied");
    }

    #[test]
    fn waiver_unblocks_and_rederives_last_report() {
        let mut eval = evaluator();
        let results = with(
            passing_results(),
            CheckResult::new(TEST_COVERAGE, Measurement::Coverage { percent: 72.0 }),
        );
        assert!(!eval.evaluate("shop", &results, NOW).ready);

        eval.waive("shop", TEST_COVERAGE, "legacy module", "ops", NOW + 7 * DAY_MS, NOW)
            .unwrap();

        let last = eval.last_report("shop").unwrap();
        assert!(last.ready);
        assert_eq!(last.waived, vec![TEST_COVERAGE.to_string()]);
        assert!(matches!(
            last.check(TEST_COVERAGE).unwrap().status,
            CheckStatus::Waived { .. }
        ));
    }

    #[test]
    fn expired_waiver_blocks_again() {
        let mut eval = evaluator();
        let results = with(
            passing_results(),
            CheckResult::new(TEST_COVERAGE, Measurement::Coverage { percent: 72.0 }),
        );
        eval.evaluate("shop", &results, NOW);
        eval.waive("shop", TEST_COVERAGE, "legacy", "ops", NOW + DAY_MS, NOW)
            .unwrap();

        let later = eval.evaluate("shop", &results, NOW + DAY_MS);
        assert!(!later.ready);
        assert_eq!(later.blockers, vec![TEST_COVERAGE.to_string()]);
    }

    #[test]
    fn reevaluate_applies_the_clock_to_stored_results() {
        let mut eval = evaluator();
        assert!(eval.reevaluate("shop", NOW).is_none());

        let results = with(
            passing_results(),
            CheckResult::new(TEST_COVERAGE, Measurement::Coverage { percent: 72.0 }),
        );
        eval.evaluate("shop", &results, NOW);
        eval.waive("shop", TEST_COVERAGE, "legacy", "ops", NOW + DAY_MS, NOW)
            .unwrap();
        assert!(eval.reevaluate("shop", NOW + 1).unwrap().ready);

        let lapsed = eval.reevaluate("shop", NOW + DAY_MS).unwrap();
        assert!(!lapsed.ready);
        assert!(!eval.last_report("shop").unwrap().ready);
    }

    #[test]
    fn waived_status_lapses_with_time() {
        let status = CheckStatus::Waived { reason: "x".to_string(), expires_at: 10 };
        assert!(!status.is_blocking(9));
        assert!(status.is_blocking(10));
        assert!(CheckStatus::Failed.is_blocking(0));
        assert!(!CheckStatus::Passed.is_blocking(0));
    }

    #[test]
    fn waive_rejections() {
        let mut eval = evaluator();

        let err = eval.waive("shop", "nope", "r", "ops", NOW + DAY_MS, NOW).unwrap_err();
        assert!(matches!(err, PolicyError::UnknownCheck(_)));

        let err = eval
            .waive("shop", PERFORMANCE_BUDGET, "r", "ops", NOW + DAY_MS, NOW)
            .unwrap_err();
        assert!(matches!(err, PolicyError::NotWaivable(_)));

        // No evaluation yet.
        let err = eval.waive("shop", TEST_COVERAGE, "r", "ops", NOW + DAY_MS, NOW).unwrap_err();
        assert!(matches!(err, PolicyError::AlreadyPassing { .. }));

        eval.evaluate("shop", &passing_results(), NOW);
        let err = eval.waive("shop", TEST_COVERAGE, "r", "ops", NOW + DAY_MS, NOW).unwrap_err();
        assert!(matches!(err, PolicyError::AlreadyPassing { .. }));

        let failing = with(
            passing_results(),
            CheckResult::new(TEST_COVERAGE, Measurement::Coverage { percent: 10.0 }),
        );
        eval.evaluate("shop", &failing, NOW);
        let err = eval.waive("shop", TEST_COVERAGE, "r", "ops", NOW, NOW).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidExpiry { .. }));
    }

    #[test]
    fn waivers_are_per_project() {
        let mut eval = evaluator();
        let failing = with(
            passing_results(),
            CheckResult::new(TEST_COVERAGE, Measurement::Coverage { percent: 10.0 }),
        );
        eval.evaluate("shop", &failing, NOW);
        eval.waive("shop", TEST_COVERAGE, "legacy", "ops", NOW + DAY_MS, NOW)
            .unwrap();

        let other = eval.evaluate("billing", &failing, NOW);
        assert!(!other.ready);
    }

    #[test]
    fn report_serializes_status_inline() {
        let mut eval = evaluator();
        let report = eval.evaluate("shop", &passing_results(), NOW);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["checks"][0]["status"], "passed");
        assert_eq!(json["checks"][0]["name"], TEST_COVERAGE);
    }
}
