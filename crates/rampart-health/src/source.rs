//! Metrics source seam.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rampart_core::Clock;
use rampart_state::Segment;

use crate::error::{HealthError, HealthResult};
use crate::sample::HealthSample;

/// Telemetry backend queried once per poll.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Aggregate metrics for `segment` of a release over the trailing `window`.
    async fn get_metrics(
        &self,
        release_id: &str,
        segment: Segment,
        window: Duration,
    ) -> HealthResult<HealthSample>;
}

/// Reported figures for one segment, without identity or timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentMetrics {
    pub error_rate: f64,
    pub p95_latency_ms: f64,
    pub health_check_success_ratio: f64,
    pub requests_per_minute: f64,
}

impl Default for SegmentMetrics {
    fn default() -> Self {
        Self {
            error_rate: 0.1,
            p95_latency_ms: 120.0,
            health_check_success_ratio: 1.0,
            requests_per_minute: 600.0,
        }
    }
}

/// In-memory source that reports whatever was last set for a release
/// segment, falling back to nominal figures.
///
/// Used by the standalone daemon where no telemetry backend is wired in.
#[derive(Clone)]
pub struct StaticMetricsSource {
    clock: Clock,
    overrides: Arc<RwLock<HashMap<(String, Segment), SegmentMetrics>>>,
    default: SegmentMetrics,
}

impl StaticMetricsSource {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            overrides: Arc::new(RwLock::new(HashMap::new())),
            default: SegmentMetrics::default(),
        }
    }

    pub fn set(&self, release_id: &str, segment: Segment, metrics: SegmentMetrics) {
        if let Ok(mut map) = self.overrides.write() {
            map.insert((release_id.to_string(), segment), metrics);
        }
    }
}

#[async_trait]
impl MetricsSource for StaticMetricsSource {
    async fn get_metrics(
        &self,
        release_id: &str,
        segment: Segment,
        _window: Duration,
    ) -> HealthResult<HealthSample> {
        let metrics = self
            .overrides
            .read()
            .map_err(|e| HealthError::Source(e.to_string()))?
            .get(&(release_id.to_string(), segment))
            .copied()
            .unwrap_or(self.default);
        Ok(HealthSample {
            release_id: release_id.to_string(),
            segment,
            error_rate: metrics.error_rate,
            p95_latency_ms: metrics.p95_latency_ms,
            health_check_success_ratio: metrics.health_check_success_ratio,
            requests_per_minute: metrics.requests_per_minute,
            timestamp: self.clock.now_ms(),
        })
    }
}
