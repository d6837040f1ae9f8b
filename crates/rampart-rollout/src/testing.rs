//! Test doubles for the rollout collaborators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rampart_core::Clock;
use rampart_health::{HealthError, HealthResult, HealthSample, MetricsSource, SegmentMetrics};
use rampart_scheduler::StageError;
use rampart_state::{
    AuditEntry, PostmortemStub, Release, ReleaseStore, Segment, StateError, StateResult,
    StateStore, TrafficSplit,
};

use crate::notify::{Notification, Notifier};
use crate::traffic::{InMemoryRouter, TrafficRouter};

/// Store wrapper that can fail a number of audit appends.
pub struct FlakyStore {
    inner: StateStore,
    fail_audit: AtomicU32,
    failed: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: StateStore) -> Self {
        Self {
            inner,
            fail_audit: AtomicU32::new(0),
            failed: AtomicU32::new(0),
        }
    }

    pub fn fail_next_audit_writes(&self, n: u32) {
        self.fail_audit.store(n, Ordering::SeqCst);
    }

    pub fn failed_audit_writes(&self) -> u32 {
        self.failed.load(Ordering::SeqCst)
    }
}

impl ReleaseStore for FlakyStore {
    fn append_audit_entry(&self, entry: &AuditEntry) -> StateResult<u64> {
        let remaining = self.fail_audit.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_audit.store(remaining - 1, Ordering::SeqCst);
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(StateError::Unavailable("injected audit failure".to_string()));
        }
        self.inner.append_audit(entry)
    }

    fn save_release(&self, release: &Release) -> StateResult<()> {
        self.inner.put_release(release)
    }

    fn load_release(&self, id: &str) -> StateResult<Option<Release>> {
        self.inner.get_release(id)
    }

    fn load_active_release(&self, project: &str, environment: &str) -> StateResult<Option<Release>> {
        self.inner.get_active_release(project, environment)
    }

    fn audit_trail(&self, release_id: &str) -> StateResult<Vec<AuditEntry>> {
        self.inner.list_audit_for_release(release_id)
    }

    fn save_postmortem(&self, stub: &PostmortemStub) -> StateResult<()> {
        self.inner.put_postmortem(stub)
    }

    fn load_postmortem(&self, release_id: &str) -> StateResult<Option<PostmortemStub>> {
        self.inner.get_postmortem(release_id)
    }

    fn list_releases(&self) -> StateResult<Vec<Release>> {
        self.inner.list_releases()
    }
}

/// In-memory router that records every call and can be told to fail.
#[derive(Clone, Default)]
pub struct RecordingRouter {
    inner: InMemoryRouter,
    calls: Arc<Mutex<Vec<TrafficSplit>>>,
    fail_next: Arc<AtomicU32>,
    unavailable: Arc<AtomicBool>,
}

impl RecordingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every split requested, including failed attempts.
    pub fn calls(&self) -> Vec<TrafficSplit> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn current(&self, project: &str, environment: &str) -> Option<TrafficSplit> {
        self.inner.current(project, environment)
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every call with a transient error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrafficRouter for RecordingRouter {
    async fn set_split(
        &self,
        project: &str,
        environment: &str,
        split: &BTreeMap<String, u8>,
    ) -> Result<(), StageError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(TrafficSplit {
                stable: split.get("stable").copied().unwrap_or(0),
                candidate: split.get("candidate").copied().unwrap_or(0),
            });
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StageError::transient("router unavailable"));
        }
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(StageError::transient("router rate limited"));
        }
        self.inner.set_split(project, environment, split).await
    }
}

type Script = dyn Fn(&str, Segment) -> Option<SegmentMetrics> + Send + Sync;

/// Metrics source driven by a closure. `None` means no data.
pub struct ScriptedMetrics {
    clock: Clock,
    script: Box<Script>,
}

impl ScriptedMetrics {
    pub fn new<F>(clock: Clock, script: F) -> Self
    where
        F: Fn(&str, Segment) -> Option<SegmentMetrics> + Send + Sync + 'static,
    {
        Self {
            clock,
            script: Box::new(script),
        }
    }

    pub fn healthy(clock: Clock) -> Self {
        Self::new(clock, |_, _| Some(SegmentMetrics::default()))
    }

    pub fn silent(clock: Clock) -> Self {
        Self::new(clock, |_, _| None)
    }
}

#[async_trait]
impl MetricsSource for ScriptedMetrics {
    async fn get_metrics(
        &self,
        release_id: &str,
        segment: Segment,
        _window: Duration,
    ) -> HealthResult<HealthSample> {
        let metrics = (self.script)(release_id, segment).ok_or_else(|| HealthError::NoData {
            release: release_id.to_string(),
            segment: segment.to_string(),
        })?;
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

/// Keeps every notification it receives.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}
