//! rampart.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the defaults
//! documented on each field. Durations are kept as strings ("2m", "30s")
//! and resolved with [`parse_duration`] by the crates that consume them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RampartConfig {
    pub server: ServerConfig,
    pub health: HealthSection,
    pub canary: CanarySection,
    pub blue_green: ObservationSection,
    pub direct: ObservationSection,
    pub rolling: RollingSection,
    pub rollback: RollbackSection,
    pub scheduler: SchedulerSection,
    pub policy: PolicySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7300,
            data_dir: PathBuf::from("/var/lib/rampart"),
        }
    }
}

/// Health classification thresholds and sampling cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSection {
    /// Time between metric polls for an active release.
    pub poll_interval: String,
    /// Error rate (percent) above which a sample is breaching.
    pub error_rate_percent: f64,
    /// How long the error rate must stay above threshold.
    pub error_rate_window: String,
    /// p95 breaches when it exceeds `latency_multiplier × baseline`.
    pub latency_multiplier: f64,
    pub latency_window: String,
    /// Fixed p95 baseline. Learned from the stable segment when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_p95_ms: Option<f64>,
    /// Health-check failure ratio (0.0–1.0) above which a sample is breaching.
    pub health_check_failure_ratio: f64,
    pub health_check_window: String,
    /// Zero samples for longer than this is itself a breach.
    pub silence_grace: String,
    /// Consecutive samples further apart than this reset breach timers.
    pub max_sample_gap: String,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            poll_interval: "15s".to_string(),
            error_rate_percent: 5.0,
            error_rate_window: "2m".to_string(),
            latency_multiplier: 2.0,
            latency_window: "5m".to_string(),
            baseline_p95_ms: None,
            health_check_failure_ratio: 0.5,
            health_check_window: "1m".to_string(),
            silence_grace: "3m".to_string(),
            max_sample_gap: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CanarySection {
    /// Candidate traffic percentages, strictly increasing, ending at 100.
    pub steps: Vec<u8>,
    /// Observation for step N is `base_observation × N`, capped at `max_observation`.
    pub base_observation: String,
    pub max_observation: String,
    pub auto_promote: bool,
    /// Roll back when a DEGRADED hold lasts longer than this. Hold forever when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_timeout: Option<String>,
    /// Resume a DEGRADED hold automatically once health recovers.
    pub auto_resume_on_recovery: bool,
}

impl Default for CanarySection {
    fn default() -> Self {
        Self {
            steps: vec![1, 5, 25, 100],
            base_observation: "5m".to_string(),
            max_observation: "10m".to_string(),
            auto_promote: true,
            degraded_timeout: None,
            auto_resume_on_recovery: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObservationSection {
    pub observation: String,
}

impl Default for ObservationSection {
    fn default() -> Self {
        Self {
            observation: "2m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollingSection {
    pub groups: u32,
    pub observation: String,
    /// "partial" reverts only updated groups, "full" reverts the fleet.
    pub revert_scope: String,
}

impl Default for RollingSection {
    fn default() -> Self {
        Self {
            groups: 4,
            observation: "2m".to_string(),
            revert_scope: "partial".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollbackSection {
    pub timeout: String,
}

impl Default for RollbackSection {
    fn default() -> Self {
        Self {
            timeout: "3m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_attempts: u32,
    pub base_backoff: String,
    pub max_backoff: String,
    pub jitter: bool,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: "200ms".to_string(),
            max_backoff: "30s".to_string(),
            jitter: true,
        }
    }
}

/// Overrides for the built-in readiness checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicySection {
    pub min_coverage_percent: f64,
    pub max_critical_vulnerabilities: u32,
    pub max_high_vulnerabilities: u32,
    pub p95_budget_ms: f64,
    pub max_error_rate_percent: f64,
    pub max_cost_delta_percent: f64,
    /// Checks to skip entirely.
    pub disabled: Vec<String>,
    /// Checks that may never be waived, on top of the built-in ones.
    pub non_waivable: Vec<String>,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            min_coverage_percent: 80.0,
            max_critical_vulnerabilities: 0,
            max_high_vulnerabilities: 2,
            p95_budget_ms: 500.0,
            max_error_rate_percent: 1.0,
            max_cost_delta_percent: 20.0,
            disabled: Vec::new(),
            non_waivable: Vec::new(),
        }
    }
}

impl RampartConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }

    /// Parse and validate a config document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: RampartConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Default config rooted at the given data directory.
    pub fn scaffold(data_dir: &Path) -> Self {
        RampartConfig {
            server: ServerConfig {
                data_dir: data_dir.to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Reject unparseable durations and malformed canary steps up front.
    pub fn validate(&self) -> ConfigResult<()> {
        let durations = [
            ("health.poll_interval", &self.health.poll_interval),
            ("health.error_rate_window", &self.health.error_rate_window),
            ("health.latency_window", &self.health.latency_window),
            ("health.health_check_window", &self.health.health_check_window),
            ("health.silence_grace", &self.health.silence_grace),
            ("health.max_sample_gap", &self.health.max_sample_gap),
            ("canary.base_observation", &self.canary.base_observation),
            ("canary.max_observation", &self.canary.max_observation),
            ("blue_green.observation", &self.blue_green.observation),
            ("direct.observation", &self.direct.observation),
            ("rolling.observation", &self.rolling.observation),
            ("rollback.timeout", &self.rollback.timeout),
            ("scheduler.base_backoff", &self.scheduler.base_backoff),
            ("scheduler.max_backoff", &self.scheduler.max_backoff),
        ];
        for (field, value) in durations {
            field_duration(field, value)?;
        }
        if let Some(timeout) = &self.canary.degraded_timeout {
            field_duration("canary.degraded_timeout", timeout)?;
        }

        validate_steps(&self.canary.steps)?;

        if self.rolling.groups == 0 {
            return Err(ConfigError::Invalid {
                field: "rolling.groups".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !matches!(self.rolling.revert_scope.as_str(), "partial" | "full") {
            return Err(ConfigError::Invalid {
                field: "rolling.revert_scope".to_string(),
                reason: format!("expected \"partial\" or \"full\", got {:?}", self.rolling.revert_scope),
            });
        }
        if self.scheduler.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Resolve a duration field, naming the field in the error.
pub fn field_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::Invalid {
        field: field.to_string(),
        reason: format!("unparseable duration {value:?}"),
    })
}

fn validate_steps(steps: &[u8]) -> ConfigResult<()> {
    let invalid = |reason: &str| ConfigError::Invalid {
        field: "canary.steps".to_string(),
        reason: reason.to_string(),
    };
    if steps.is_empty() {
        return Err(invalid("at least one step is required"));
    }
    if steps.iter().any(|&s| s == 0 || s > 100) {
        return Err(invalid("steps must be within 1..=100"));
    }
    if steps.windows(2).any(|w| w[0] >= w[1]) {
        return Err(invalid("steps must be strictly increasing"));
    }
    if steps.last() != Some(&100) {
        return Err(invalid("the final step must be 100"));
    }
    Ok(())
}
