//! Readiness checks, their rules, and the measurements they consume.

use std::fmt;

use rampart_core::PolicySection;
use serde::{Deserialize, Serialize};

pub const TEST_COVERAGE: &str = "test_coverage";
pub const SECURITY_SCAN: &str = "security_scan";
pub const PERFORMANCE_BUDGET: &str = "performance_budget";
pub const COST_BUDGET: &str = "cost_budget";
pub const COMPLIANCE_CHECK: &str = "compliance_check";

const REMEDIATION_BASE: &str = "https://docs.rampart.dev/readiness";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Quality,
    Security,
    Performance,
    Cost,
    Compliance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Threshold parameters for a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rule {
    MinCoverage { min_percent: f64 },
    Vulnerabilities { max_critical: u32, max_high: u32 },
    Performance { p95_budget_ms: f64, max_error_rate_percent: f64 },
    CostDelta { max_percent: f64 },
    /// Passes when no control failed.
    Compliance,
}

/// Raw metrics supplied for one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measurement {
    Coverage {
        percent: f64,
    },
    Vulnerabilities {
        critical: u32,
        high: u32,
        #[serde(default)]
        medium: u32,
        #[serde(default)]
        low: u32,
    },
    Performance {
        p95_ms: f64,
        error_rate_percent: f64,
    },
    CostDelta {
        percent: f64,
    },
    Compliance {
        #[serde(default)]
        failed_controls: Vec<String>,
    },
}

impl Measurement {
    fn kind(&self) -> &'static str {
        match self {
            Measurement::Coverage { .. } => "coverage",
            Measurement::Vulnerabilities { .. } => "vulnerabilities",
            Measurement::Performance { .. } => "performance",
            Measurement::CostDelta { .. } => "cost_delta",
            Measurement::Compliance { .. } => "compliance",
        }
    }
}

/// A measurement tagged with the check it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: String,
    #[serde(flatten)]
    pub measurement: Measurement,
}

impl CheckResult {
    pub fn new(check: impl Into<String>, measurement: Measurement) -> Self {
        Self {
            check: check.into(),
            measurement,
        }
    }
}

/// Pass/fail verdict of a rule plus a human-readable explanation.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub passed: bool,
    pub message: String,
}

impl Verdict {
    fn pass(message: String) -> Self {
        Self { passed: true, message }
    }

    fn fail(message: String) -> Self {
        Self { passed: false, message }
    }
}

impl Rule {
    pub fn apply(&self, measurement: &Measurement) -> Verdict {
        match (self, measurement) {
            (Rule::MinCoverage { min_percent }, Measurement::Coverage { percent }) => {
                let message = format!("coverage {percent:.1}% (minimum {min_percent:.1}%)");
                if percent >= min_percent {
                    Verdict::pass(message)
                } else {
                    Verdict::fail(message)
                }
            }
            (
                Rule::Vulnerabilities { max_critical, max_high },
                Measurement::Vulnerabilities { critical, high, .. },
            ) => {
                let message = format!(
                    "{critical} critical (max {max_critical}), {high} high (max {max_high})"
                );
                if critical <= max_critical && high <= max_high {
                    Verdict::pass(message)
                } else {
                    Verdict::fail(message)
                }
            }
            (
                Rule::Performance { p95_budget_ms, max_error_rate_percent },
                Measurement::Performance { p95_ms, error_rate_percent },
            ) => {
                let message = format!(
                    "p95 {p95_ms:.0}ms (budget {p95_budget_ms:.0}ms), error rate {error_rate_percent:.2}% (limit {max_error_rate_percent:.2}%)"
                );
                if p95_ms <= p95_budget_ms && error_rate_percent < max_error_rate_percent {
                    Verdict::pass(message)
                } else {
                    Verdict::fail(message)
                }
            }
            (Rule::CostDelta { max_percent }, Measurement::CostDelta { percent }) => {
                let message = format!("cost delta {percent:+.1}% (max {max_percent:.1}%)");
                if percent <= max_percent {
                    Verdict::pass(message)
                } else {
                    Verdict::fail(message)
                }
            }
            (Rule::Compliance, Measurement::Compliance { failed_controls }) => {
                if failed_controls.is_empty() {
                    Verdict::pass("all controls passed".to_string())
                } else {
                    Verdict::fail(format!("failed controls: {}", failed_controls.join(", ")))
                }
            }
            (rule, other) => Verdict::fail(format!(
                "{} rule cannot use a {} measurement",
                rule,
                other.kind()
            )),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rule::MinCoverage { .. } => "min_coverage",
            Rule::Vulnerabilities { .. } => "vulnerabilities",
            Rule::Performance { .. } => "performance",
            Rule::CostDelta { .. } => "cost_delta",
            Rule::Compliance => "compliance",
        };
        f.write_str(name)
    }
}

/// A named readiness rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCheck {
    pub name: String,
    pub category: Category,
    pub severity: Severity,
    pub waivable: bool,
    pub rule: Rule,
    pub remediation_url: String,
}

impl PolicyCheck {
    fn new(name: &str, category: Category, severity: Severity, waivable: bool, rule: Rule) -> Self {
        Self {
            name: name.to_string(),
            category,
            severity,
            waivable,
            rule,
            remediation_url: format!("{REMEDIATION_BASE}/{}", name.replace('_', "-")),
        }
    }
}

/// The built-in checks with thresholds taken from `[policy]`.
///
/// `performance_budget` is never waivable. Checks listed in `disabled`
/// are left out and names in `non_waivable` lose their waivable flag.
pub fn default_checks(policy: &PolicySection) -> Vec<PolicyCheck> {
    let checks = vec![
        PolicyCheck::new(
            TEST_COVERAGE,
            Category::Quality,
            Severity::Medium,
            true,
            Rule::MinCoverage {
                min_percent: policy.min_coverage_percent,
            },
        ),
        PolicyCheck::new(
            SECURITY_SCAN,
            Category::Security,
            Severity::High,
            true,
            Rule::Vulnerabilities {
                max_critical: policy.max_critical_vulnerabilities,
                max_high: policy.max_high_vulnerabilities,
            },
        ),
        PolicyCheck::new(
            PERFORMANCE_BUDGET,
            Category::Performance,
            Severity::High,
            false,
            Rule::Performance {
                p95_budget_ms: policy.p95_budget_ms,
                max_error_rate_percent: policy.max_error_rate_percent,
            },
        ),
        PolicyCheck::new(
            COST_BUDGET,
            Category::Cost,
            Severity::Medium,
            true,
            Rule::CostDelta {
                max_percent: policy.max_cost_delta_percent,
            },
        ),
        PolicyCheck::new(
            COMPLIANCE_CHECK,
            Category::Compliance,
            Severity::Medium,
            true,
            Rule::Compliance,
        ),
    ];

    checks
        .into_iter()
        .filter(|c| !policy.disabled.contains(&c.name))
        .map(|mut c| {
            if policy.non_waivable.contains(&c.name) {
                c.waivable = false;
            }
            c
        })
        .collect()
}
