//! Health monitor — one polling task per active release.
//!
//! Each task samples the candidate segment on a fixed cadence, classifies
//! the rolling window, and pushes a [`HealthReport`] to the owning
//! controller. Tasks end when their watch shutdown fires or the report
//! channel closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rampart_core::{Clock, HealthSection, field_duration};
use rampart_state::Segment;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classifier::{Classification, HealthStatus, classify};
use crate::error::HealthResult;
use crate::sample::{HealthSample, Thresholds};
use crate::source::MetricsSource;
use crate::window::{PushOutcome, SampleWindow};

/// One classification pushed to a release controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub release_id: String,
    pub classification: Classification,
    /// The sample that triggered this report, if the poll succeeded.
    pub sample: Option<HealthSample>,
    pub at: u64,
}

impl HealthReport {
    pub fn status(&self) -> HealthStatus {
        self.classification.status
    }
}

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages polling tasks for all active releases.
pub struct HealthMonitor {
    source: Arc<dyn MetricsSource>,
    thresholds: Thresholds,
    poll_interval: Duration,
    clock: Clock,
    /// Active monitors: release_id → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
}

impl HealthMonitor {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        thresholds: Thresholds,
        poll_interval: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            source,
            thresholds,
            poll_interval,
            clock,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn from_config(
        source: Arc<dyn MetricsSource>,
        health: &HealthSection,
        clock: Clock,
    ) -> HealthResult<Self> {
        let thresholds = Thresholds::from_config(health)?;
        let poll_interval = field_duration("health.poll_interval", &health.poll_interval)?;
        Ok(Self::new(source, thresholds, poll_interval, clock))
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Take a single sample of one release segment.
    pub async fn sample(&self, release_id: &str, segment: Segment) -> HealthResult<HealthSample> {
        self.source
            .get_metrics(release_id, segment, self.poll_interval)
            .await
    }

    /// Start polling a release. Reports go to `reports` until the monitor
    /// is stopped. A monitor already running for the release is replaced.
    pub async fn start_monitor(&self, release_id: &str, reports: mpsc::Sender<HealthReport>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let poller = Poller {
            release_id: release_id.to_string(),
            source: self.source.clone(),
            thresholds: self.thresholds.clone(),
            poll_interval: self.poll_interval,
            clock: self.clock,
        };
        let handle = tokio::spawn(poller.run(reports, shutdown_rx));

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            release_id.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(release = %release_id, interval = ?self.poll_interval, "health monitor started");
    }

    pub async fn stop_monitor(&self, release_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(release_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(release = %release_id, "health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(release = %id, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, release_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(release_id)
    }
}

struct Poller {
    release_id: String,
    source: Arc<dyn MetricsSource>,
    thresholds: Thresholds,
    poll_interval: Duration,
    clock: Clock,
}

impl Poller {
    async fn run(mut self, reports: mpsc::Sender<HealthReport>, mut shutdown: watch::Receiver<bool>) {
        let mut window = SampleWindow::new(self.thresholds.retention());
        let since = self.clock.now_ms();
        debug!(release = %self.release_id, "health loop starting");

        loop {
            if self.thresholds.baseline_p95_ms.is_none() {
                self.learn_baseline().await;
            }

            let sample = match self
                .source
                .get_metrics(&self.release_id, Segment::Candidate, self.poll_interval)
                .await
            {
                Ok(sample) => {
                    debug!(
                        release = %self.release_id,
                        error_rate = sample.error_rate,
                        p95_ms = sample.p95_latency_ms,
                        "health sample"
                    );
                    if window.push(sample.clone()) == PushOutcome::Accepted {
                        Some(sample)
                    } else {
                        None
                    }
                }
                Err(e) => {
                    warn!(release = %self.release_id, error = %e, "health poll failed");
                    None
                }
            };

            let now = self.clock.now_ms();
            let classification = classify(&window, &self.thresholds, now, since);
            if classification.status != HealthStatus::Healthy {
                warn!(
                    release = %self.release_id,
                    status = %classification.status,
                    reason = %classification.reason,
                    "release health not nominal"
                );
            }
            let report = HealthReport {
                release_id: self.release_id.clone(),
                classification,
                sample,
                at: now,
            };
            if reports.send(report).await.is_err() {
                debug!(release = %self.release_id, "report channel closed, health loop exiting");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    debug!(release = %self.release_id, "health loop shutting down");
                    break;
                }
            }
        }
    }

    async fn learn_baseline(&mut self) {
        match self
            .source
            .get_metrics(&self.release_id, Segment::Stable, self.poll_interval)
            .await
        {
            Ok(stable) => {
                info!(
                    release = %self.release_id,
                    baseline_p95_ms = stable.p95_latency_ms,
                    "latency baseline learned from stable segment"
                );
                self.thresholds.baseline_p95_ms = Some(stable.p95_latency_ms);
            }
            Err(e) => debug!(release = %self.release_id, error = %e, "stable baseline unavailable"),
        }
    }
}
