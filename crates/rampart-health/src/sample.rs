//! Health samples and the thresholds they are judged against.

use std::fmt;
use std::time::Duration;

use rampart_core::{ConfigResult, HealthSection, field_duration};
use rampart_state::Segment;
use serde::{Deserialize, Serialize};

/// One poll of a release segment's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub release_id: String,
    pub segment: Segment,
    /// Percent of requests that failed.
    pub error_rate: f64,
    pub p95_latency_ms: f64,
    /// Fraction (0.0–1.0) of health probes that succeeded.
    pub health_check_success_ratio: f64,
    pub requests_per_minute: f64,
    /// Unix timestamp (millis).
    pub timestamp: u64,
}

/// A metric that can breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    ErrorRate,
    Latency,
    HealthCheck,
    /// No samples at all for longer than the silence grace.
    Silence,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Signal::ErrorRate => "error_rate",
            Signal::Latency => "latency",
            Signal::HealthCheck => "health_check",
            Signal::Silence => "silence",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub error_rate_percent: f64,
    pub error_rate_window: Duration,
    pub latency_multiplier: f64,
    pub latency_window: Duration,
    /// Latency is not judged until a baseline is known.
    pub baseline_p95_ms: Option<f64>,
    pub health_check_failure_ratio: f64,
    pub health_check_window: Duration,
    pub silence_grace: Duration,
    pub max_sample_gap: Duration,
}

impl Thresholds {
    pub fn from_config(health: &HealthSection) -> ConfigResult<Self> {
        Ok(Self {
            error_rate_percent: health.error_rate_percent,
            error_rate_window: field_duration("health.error_rate_window", &health.error_rate_window)?,
            latency_multiplier: health.latency_multiplier,
            latency_window: field_duration("health.latency_window", &health.latency_window)?,
            baseline_p95_ms: health.baseline_p95_ms,
            health_check_failure_ratio: health.health_check_failure_ratio,
            health_check_window: field_duration(
                "health.health_check_window",
                &health.health_check_window,
            )?,
            silence_grace: field_duration("health.silence_grace", &health.silence_grace)?,
            max_sample_gap: field_duration("health.max_sample_gap", &health.max_sample_gap)?,
        })
    }

    /// How long a signal must breach before it is sustained.
    pub fn window_for(&self, signal: Signal) -> Duration {
        match signal {
            Signal::ErrorRate => self.error_rate_window,
            Signal::Latency => self.latency_window,
            Signal::HealthCheck => self.health_check_window,
            Signal::Silence => self.silence_grace,
        }
    }

    /// Longest history any signal needs.
    pub fn retention(&self) -> Duration {
        self.error_rate_window
            .max(self.latency_window)
            .max(self.health_check_window)
            + self.max_sample_gap
    }

    /// Whether a single sample breaches `signal`.
    pub fn breaches(&self, sample: &HealthSample, signal: Signal) -> bool {
        match signal {
            Signal::ErrorRate => sample.error_rate > self.error_rate_percent,
            Signal::Latency => self
                .baseline_p95_ms
                .is_some_and(|base| sample.p95_latency_ms > base * self.latency_multiplier),
            Signal::HealthCheck => {
                1.0 - sample.health_check_success_ratio > self.health_check_failure_ratio
            }
            Signal::Silence => false,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            error_rate_percent: 5.0,
            error_rate_window: Duration::from_secs(120),
            latency_multiplier: 2.0,
            latency_window: Duration::from_secs(300),
            baseline_p95_ms: None,
            health_check_failure_ratio: 0.5,
            health_check_window: Duration::from_secs(60),
            silence_grace: Duration::from_secs(180),
            max_sample_gap: Duration::from_secs(30),
        }
    }
}
