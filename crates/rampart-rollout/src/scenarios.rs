//! End-to-end release scenarios under a paused tokio clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rampart_core::{Clock, RampartConfig};
use rampart_health::SegmentMetrics;
use rampart_policy::{
    COMPLIANCE_CHECK, COST_BUDGET, CheckResult, Measurement, PERFORMANCE_BUDGET, SECURITY_SCAN,
    TEST_COVERAGE,
};
use rampart_state::{
    Release, ReleaseStatus, Segment, StageRecord, StageStatus, StateStore, Strategy, TrafficSplit,
};

use crate::audit::HEALTH_ACTOR;
use crate::error::RolloutError;
use crate::notify::AlertLevel;
use crate::orchestrator::{Collaborators, CreateReleaseRequest, ReleaseOrchestrator};
use crate::testing::{FlakyStore, RecordingNotifier, RecordingRouter, ScriptedMetrics};

const T0: u64 = 1_700_000_000_000;
const PROJECT: &str = "shop";
const ENV: &str = "production";

struct Harness {
    orchestrator: ReleaseOrchestrator,
    router: RecordingRouter,
    notifier: RecordingNotifier,
    store: StateStore,
    flaky: Arc<FlakyStore>,
    clock: Clock,
}

fn config() -> RampartConfig {
    let mut config = RampartConfig::default();
    config.scheduler.base_backoff = "100ms".to_string();
    config.scheduler.max_backoff = "1s".to_string();
    config.scheduler.jitter = false;
    config
}

fn harness_with<F>(config: RampartConfig, script: F) -> Harness
where
    F: Fn(&RecordingRouter, &str, Segment) -> Option<SegmentMetrics> + Send + Sync + 'static,
{
    let clock = Clock::anchored_at(T0);
    let store = StateStore::open_in_memory().unwrap();
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    let router = RecordingRouter::new();
    let notifier = RecordingNotifier::default();

    let observed = router.clone();
    let metrics = ScriptedMetrics::new(clock, move |release, segment| script(&observed, release, segment));
    let collaborators = Collaborators::new(
        Arc::new(router.clone()),
        Arc::new(metrics),
        Arc::new(notifier.clone()),
    )
    .with_release_store(flaky.clone());
    let orchestrator = ReleaseOrchestrator::new(&config, store.clone(), collaborators, clock).unwrap();

    Harness {
        orchestrator,
        router,
        notifier,
        store,
        flaky,
        clock,
    }
}

fn healthy() -> Option<SegmentMetrics> {
    Some(SegmentMetrics::default())
}

fn erroring(error_rate: f64) -> Option<SegmentMetrics> {
    Some(SegmentMetrics {
        error_rate,
        ..SegmentMetrics::default()
    })
}

/// Candidate erroring at `error_rate`, stable healthy.
fn candidate_errors(error_rate: f64) -> impl Fn(&RecordingRouter, &str, Segment) -> Option<SegmentMetrics> {
    move |_, _, segment| match segment {
        Segment::Stable => healthy(),
        Segment::Candidate => erroring(error_rate),
    }
}

fn check_results(coverage: f64) -> Vec<CheckResult> {
    vec![
        CheckResult::new(TEST_COVERAGE, Measurement::Coverage { percent: coverage }),
        CheckResult::new(
            SECURITY_SCAN,
            Measurement::Vulnerabilities { critical: 0, high: 1, medium: 3, low: 8 },
        ),
        CheckResult::new(
            PERFORMANCE_BUDGET,
            Measurement::Performance { p95_ms: 210.0, error_rate_percent: 0.3 },
        ),
        CheckResult::new(COST_BUDGET, Measurement::CostDelta { percent: 3.5 }),
        CheckResult::new(COMPLIANCE_CHECK, Measurement::Compliance { failed_controls: vec![] }),
    ]
}

fn request(strategy: Strategy) -> CreateReleaseRequest {
    CreateReleaseRequest {
        project: PROJECT.to_string(),
        environment: ENV.to_string(),
        artifact: "sha-7f3a9c1".to_string(),
        strategy,
        auto_promote: None,
        last_known_good: Some("sha-1b2c3d4".to_string()),
        force: false,
        check_results: Some(check_results(91.0)),
        requested_by: "alice".to_string(),
    }
}

impl Harness {
    async fn wait<F>(&self, id: &str, done: F) -> Release
    where
        F: FnMut(&Release) -> bool,
    {
        self.orchestrator.handle(id).await.unwrap().wait_for(done).await
    }

    async fn finish(&self, id: &str) -> Release {
        self.wait(id, |r| r.is_terminal()).await
    }

    /// Let spawned notification tasks run.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn low_coverage_blocks_the_release() {
    let h = harness_with(config(), |_, _, _| healthy());
    let mut req = request(Strategy::Canary);
    req.check_results = Some(check_results(72.0));

    let err = h.orchestrator.create_release(req).await.unwrap_err();
    match err {
        RolloutError::PolicyBlocked { blockers, details, .. } => {
            assert_eq!(blockers, vec![TEST_COVERAGE.to_string()]);
            assert!(details[0].contains("https://"));
        }
        other => panic!("expected PolicyBlocked, got {other:?}"),
    }
    assert!(h.orchestrator.list_releases().await.unwrap().is_empty());
    assert!(h.router.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn waiver_admits_a_blocked_release() {
    let h = harness_with(config(), |_, _, _| healthy());
    h.orchestrator
        .evaluate_readiness(PROJECT, &check_results(72.0))
        .await
        .unwrap();
    h.orchestrator
        .waive_policy_check(PROJECT, TEST_COVERAGE, "legacy module", "bob", T0 + 86_400_000)
        .await
        .unwrap();
    assert!(h.orchestrator.get_readiness(PROJECT).await.unwrap().unwrap().ready);

    let mut req = request(Strategy::Direct);
    req.check_results = None;
    let release = h.orchestrator.create_release(req).await.unwrap();
    let trail = h.orchestrator.audit_trail(&release.id).await.unwrap();
    assert!(trail[0].reason.contains("waived: test_coverage"));
}

#[tokio::test(start_paused = true)]
async fn sustained_canary_errors_roll_back_within_three_minutes() {
    let mut config = config();
    config.canary.steps = vec![5, 25, 100];
    let h = harness_with(config, candidate_errors(7.0));

    let release = h.orchestrator.create_release(request(Strategy::Canary)).await.unwrap();
    let done = h.finish(&release.id).await;

    assert_eq!(done.status, ReleaseStatus::RolledBack);
    assert_eq!(done.traffic, TrafficSplit::all_stable());
    assert!(done.reason.as_deref().unwrap().contains("canary_5pct"));
    assert!(h.clock.now_ms() - release.created_at <= 180_000);
    assert_eq!(h.router.current(PROJECT, ENV), Some(TrafficSplit::all_stable()));

    let trail = h.orchestrator.audit_trail(&release.id).await.unwrap();
    let breach = trail.iter().find(|e| e.action == "health.breach").unwrap();
    assert_eq!(breach.actor, HEALTH_ACTOR);
    assert_eq!(breach.stage.as_deref(), Some("canary_5pct"));
    assert!(trail.windows(2).all(|w| w[0].seq < w[1].seq));

    let result = h
        .orchestrator
        .rollback(&release.id, "alice", "again")
        .await
        .unwrap();
    assert_eq!(result.restored_artifact.as_deref(), Some("sha-1b2c3d4"));
    let postmortem = h.store.get_postmortem(&release.id).unwrap().unwrap();
    assert_eq!(postmortem.id, result.postmortem_id);
    assert!(postmortem.audit_refs.contains(&breach.seq));
}

#[tokio::test(start_paused = true)]
async fn healthy_blue_green_completes() {
    let h = harness_with(config(), |_, _, _| healthy());
    let mut events = h.orchestrator.subscribe();

    let release = h.orchestrator.create_release(request(Strategy::BlueGreen)).await.unwrap();
    let done = h.finish(&release.id).await;

    assert_eq!(done.status, ReleaseStatus::Completed);
    assert_eq!(done.traffic, TrafficSplit { stable: 0, candidate: 100 });
    assert_eq!(h.router.current(PROJECT, ENV), Some(TrafficSplit::candidate(100)));
    assert!(done.updated_at - release.created_at >= 120_000);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().all(|e| e.release_id == release.id));
    assert!(seen.iter().any(|e| e.percent == 100 && e.stage.as_deref() == Some("switch_traffic")));
    assert_eq!(seen.last().unwrap().status, ReleaseStatus::Completed);

    h.settle().await;
    assert!(h.notifier.sent().iter().any(|n| n.level == AlertLevel::Info));
}

#[tokio::test(start_paused = true)]
async fn silent_metrics_trigger_rollback() {
    let h = harness_with(config(), |_, _, _| None);
    let release = h.orchestrator.create_release(request(Strategy::Canary)).await.unwrap();
    let done = h.finish(&release.id).await;

    assert_eq!(done.status, ReleaseStatus::RolledBack);
    assert!(done.reason.as_deref().unwrap().contains("silence"));
    assert!(h.clock.now_ms() - release.created_at <= 240_000);
}

#[tokio::test(start_paused = true)]
async fn one_active_release_per_environment() {
    let h = harness_with(config(), |_, _, _| healthy());
    let first = h.orchestrator.create_release(request(Strategy::BlueGreen)).await.unwrap();

    let err = h
        .orchestrator
        .create_release(request(Strategy::BlueGreen))
        .await
        .unwrap_err();
    assert!(matches!(err, RolloutError::ActiveReleaseExists { ref release_id, .. } if *release_id == first.id));

    let mut staging = request(Strategy::BlueGreen);
    staging.environment = "staging".to_string();
    h.orchestrator.create_release(staging).await.unwrap();

    let mut forced = request(Strategy::BlueGreen);
    forced.force = true;
    let second = h.orchestrator.create_release(forced).await.unwrap();

    let superseded = h.orchestrator.get_release_status(&first.id).await.unwrap();
    assert_eq!(superseded.status, ReleaseStatus::RolledBack);
    assert_eq!(superseded.reason, Some(format!("superseded by {}", second.id)));

    let active = h.store.get_active_release(PROJECT, ENV).unwrap().unwrap();
    assert_eq!(active.id, second.id);
}

#[tokio::test(start_paused = true)]
async fn supersede_does_not_stall_other_environments() {
    let h = harness_with(config(), |_, _, _| healthy());
    let first = h.orchestrator.create_release(request(Strategy::Canary)).await.unwrap();
    h.wait(&first.id, |r| r.traffic.candidate == 1).await;

    let mut staging = request(Strategy::Canary);
    staging.environment = "staging".to_string();
    let staging = h.orchestrator.create_release(staging).await.unwrap();
    h.wait(&staging.id, |r| r.traffic.candidate == 1).await;

    h.router.set_unavailable(true);
    let mut forced = request(Strategy::BlueGreen);
    forced.force = true;
    let supersede = h.orchestrator.create_release(forced);
    tokio::pin!(supersede);
    tokio::select! {
        _ = &mut supersede => panic!("supersede finished while the router was down"),
        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
    }

    let status = tokio::time::timeout(
        Duration::from_millis(10),
        h.orchestrator.get_release_status(&staging.id),
    )
    .await
    .expect("status lookup blocked behind the supersede")
    .unwrap();
    assert_eq!(status.status, ReleaseStatus::Running);

    // The environment stays claimed while the supersede runs.
    let mut competing = request(Strategy::Direct);
    competing.force = true;
    let err = h.orchestrator.create_release(competing).await.unwrap_err();
    assert!(matches!(err, RolloutError::ActiveReleaseExists { .. }));

    h.router.set_unavailable(false);
    let second = supersede.await.unwrap();
    let superseded = h.orchestrator.get_release_status(&first.id).await.unwrap();
    assert_eq!(superseded.status, ReleaseStatus::RolledBack);
    assert_eq!(superseded.reason, Some(format!("superseded by {}", second.id)));
}

#[tokio::test(start_paused = true)]
async fn slash_in_project_or_environment_is_rejected() {
    let h = harness_with(config(), |_, _, _| healthy());
    let mut req = request(Strategy::Direct);
    req.project = "shop/eu".to_string();
    let err = h.orchestrator.create_release(req).await.unwrap_err();
    assert!(matches!(err, RolloutError::InvalidRequest(_)));

    let mut req = request(Strategy::Direct);
    req.environment = "eu/production".to_string();
    let err = h.orchestrator.create_release(req).await.unwrap_err();
    assert!(matches!(err, RolloutError::InvalidRequest(_)));
    assert!(h.router.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn canary_sets_each_split_exactly_once() {
    let h = harness_with(config(), |_, _, _| healthy());
    let release = h.orchestrator.create_release(request(Strategy::Canary)).await.unwrap();
    let done = h.finish(&release.id).await;
    assert_eq!(done.status, ReleaseStatus::Completed);

    let calls = h.router.calls();
    let pcts: Vec<u8> = calls.iter().map(|s| s.candidate).collect();
    assert_eq!(pcts, vec![1, 5, 25, 100]);
    assert!(calls.iter().all(|s| s.is_valid()));

    for stage in ["canary_1pct", "canary_5pct", "canary_25pct", "canary_100pct"] {
        let attempts = h
            .store
            .list_stage_attempts(&release.id, &format!("traffic.{stage}"))
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, StageStatus::Done);
    }
}

#[tokio::test(start_paused = true)]
async fn rollback_is_idempotent() {
    let h = harness_with(config(), |_, _, _| healthy());
    let release = h.orchestrator.create_release(request(Strategy::Direct)).await.unwrap();
    h.wait(&release.id, |r| r.traffic.candidate == 100).await;

    let first = h
        .orchestrator
        .rollback(&release.id, "alice", "bad config pushed")
        .await
        .unwrap();
    assert_eq!(first.reason, "bad config pushed");
    assert_eq!(first.traffic, TrafficSplit::all_stable());
    let calls = h.router.calls().len();

    let second = h
        .orchestrator
        .rollback(&release.id, "alice", "again")
        .await
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(h.router.calls().len(), calls);

    let trail = h.orchestrator.audit_trail(&release.id).await.unwrap();
    let entry = trail.iter().find(|e| e.action == "release.rollback").unwrap();
    assert_eq!(entry.actor, "alice");
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_rollback_escalates_then_retries() {
    let h = harness_with(config(), |_, _, _| healthy());
    let release = h.orchestrator.create_release(request(Strategy::Direct)).await.unwrap();
    h.wait(&release.id, |r| r.traffic.candidate == 100).await;

    h.router.set_unavailable(true);
    let err = h
        .orchestrator
        .rollback(&release.id, "alice", "latency spike")
        .await
        .unwrap_err();
    assert!(matches!(err, RolloutError::RollbackTimeout { .. }));

    let escalated = h.orchestrator.get_release_status(&release.id).await.unwrap();
    assert_eq!(escalated.status, ReleaseStatus::Escalated);
    h.settle().await;
    assert!(h.notifier.sent().iter().any(|n| n.level == AlertLevel::Critical));

    let err = h.orchestrator.pause(&release.id, "alice").await.unwrap_err();
    assert!(matches!(err, RolloutError::InvalidTransition { status: ReleaseStatus::Escalated, .. }));

    h.router.set_unavailable(false);
    let result = h
        .orchestrator
        .rollback(&release.id, "alice", "retry after router fix")
        .await
        .unwrap();
    assert_eq!(result.reason, "retry after router fix");
    let done = h.orchestrator.get_release_status(&release.id).await.unwrap();
    assert_eq!(done.status, ReleaseStatus::RolledBack);
    assert_eq!(h.router.current(PROJECT, ENV), Some(TrafficSplit::all_stable()));
}

#[tokio::test(start_paused = true)]
async fn audit_failures_are_retried_not_lost() {
    let h = harness_with(config(), |_, _, _| healthy());
    h.flaky.fail_next_audit_writes(4);

    let release = h.orchestrator.create_release(request(Strategy::BlueGreen)).await.unwrap();
    let done = h.finish(&release.id).await;
    assert_eq!(done.status, ReleaseStatus::Completed);
    assert_eq!(h.flaky.failed_audit_writes(), 4);

    let trail = h.orchestrator.audit_trail(&release.id).await.unwrap();
    let seqs: Vec<u64> = trail.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert_eq!(seqs, expected);
    assert_eq!(trail[0].action, "release.created");
    assert!(trail.iter().any(|e| e.diff_ref.as_deref() == Some("promoting -> completed")));
}

#[tokio::test(start_paused = true)]
async fn manual_promotion_between_canary_steps() {
    let h = harness_with(config(), |_, _, _| healthy());
    let mut req = request(Strategy::Canary);
    req.auto_promote = Some(false);
    let release = h.orchestrator.create_release(req).await.unwrap();
    assert!(!release.auto_promote);

    let held = h.wait(&release.id, |r| r.status == ReleaseStatus::Paused).await;
    assert_eq!(held.current_stage.as_deref(), Some("canary_1pct"));
    assert_eq!(held.traffic, TrafficSplit::candidate(1));

    let promoted = h.orchestrator.promote(&release.id, "alice").await.unwrap();
    assert_eq!(promoted.status, ReleaseStatus::Running);
    assert_eq!(promoted.current_stage.as_deref(), Some("canary_5pct"));

    let err = h.orchestrator.promote(&release.id, "alice").await.unwrap_err();
    assert!(matches!(err, RolloutError::InvalidTransition { status: ReleaseStatus::Running, .. }));
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_hold_the_step() {
    let h = harness_with(config(), |_, _, _| healthy());
    let release = h.orchestrator.create_release(request(Strategy::BlueGreen)).await.unwrap();
    h.wait(&release.id, |r| r.traffic.candidate == 100).await;

    let paused = h.orchestrator.pause(&release.id, "alice").await.unwrap();
    assert_eq!(paused.status, ReleaseStatus::Paused);

    tokio::time::sleep(Duration::from_secs(600)).await;
    let still = h.orchestrator.get_release_status(&release.id).await.unwrap();
    assert_eq!(still.status, ReleaseStatus::Paused);

    let resumed = h.orchestrator.resume(&release.id, "alice").await.unwrap();
    assert_eq!(resumed.status, ReleaseStatus::Running);
    assert_eq!(resumed.current_stage.as_deref(), Some("switch_traffic"));

    let done = h.finish(&release.id).await;
    assert_eq!(done.status, ReleaseStatus::Completed);
    assert_eq!(h.router.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_commands_are_rejected() {
    let h = harness_with(config(), |_, _, _| healthy());
    let err = h.orchestrator.promote("rel-missing", "alice").await.unwrap_err();
    assert!(matches!(err, RolloutError::ReleaseNotFound(_)));

    let release = h.orchestrator.create_release(request(Strategy::Direct)).await.unwrap();
    h.wait(&release.id, |r| r.status == ReleaseStatus::Running).await;
    let err = h.orchestrator.resume(&release.id, "alice").await.unwrap_err();
    assert!(matches!(err, RolloutError::InvalidTransition { .. }));

    let done = h.finish(&release.id).await;
    assert_eq!(done.status, ReleaseStatus::Completed);
    for err in [
        h.orchestrator.pause(&release.id, "alice").await.unwrap_err(),
        h.orchestrator.promote(&release.id, "alice").await.unwrap_err(),
    ] {
        assert!(matches!(err, RolloutError::InvalidTransition { status: ReleaseStatus::Completed, .. }));
    }
    let err = h
        .orchestrator
        .rollback(&release.id, "alice", "too late")
        .await
        .unwrap_err();
    assert!(matches!(err, RolloutError::InvalidTransition { .. }));
}

#[tokio::test(start_paused = true)]
async fn degraded_canary_holds_then_times_out() {
    let mut config = config();
    config.health.error_rate_window = "30m".to_string();
    config.canary.degraded_timeout = Some("10m".to_string());
    let h = harness_with(config, candidate_errors(7.0));

    let release = h.orchestrator.create_release(request(Strategy::Canary)).await.unwrap();
    let held = h.wait(&release.id, |r| r.status == ReleaseStatus::Paused).await;
    assert_eq!(held.current_stage.as_deref(), Some("canary_1pct"));

    let done = h.finish(&release.id).await;
    assert_eq!(done.status, ReleaseStatus::RolledBack);
    assert!(done.reason.as_deref().unwrap().contains("timed out"));
    assert!(done.updated_at - held.updated_at >= 600_000);
}

#[tokio::test(start_paused = true)]
async fn degraded_canary_resumes_on_recovery_when_enabled() {
    let mut config = config();
    config.health.error_rate_window = "30m".to_string();
    config.canary.auto_resume_on_recovery = true;
    let degraded = Arc::new(AtomicBool::new(true));
    let flag = degraded.clone();
    let h = harness_with(config, move |_, _, segment| {
        if segment == Segment::Candidate && flag.load(Ordering::SeqCst) {
            erroring(7.0)
        } else {
            healthy()
        }
    });

    let release = h.orchestrator.create_release(request(Strategy::Canary)).await.unwrap();
    h.wait(&release.id, |r| r.status == ReleaseStatus::Paused).await;
    degraded.store(false, Ordering::SeqCst);

    let done = h.finish(&release.id).await;
    assert_eq!(done.status, ReleaseStatus::Completed);
    let trail = h.orchestrator.audit_trail(&release.id).await.unwrap();
    assert!(trail.iter().any(|e| e.reason == "health recovered"));
}

#[tokio::test(start_paused = true)]
async fn rolling_failure_reverts_updated_groups() {
    let mut config = config();
    config.rolling.observation = "5m".to_string();
    let h = harness_with(config, |router, _, segment| {
        let half = router
            .current(PROJECT, ENV)
            .is_some_and(|split| split.candidate >= 50);
        if segment == Segment::Candidate && half {
            erroring(9.0)
        } else {
            healthy()
        }
    });

    let release = h.orchestrator.create_release(request(Strategy::Rolling)).await.unwrap();
    let done = h.finish(&release.id).await;
    assert_eq!(done.status, ReleaseStatus::RolledBack);
    assert_eq!(done.current_stage.as_deref(), Some("group_2_of_4"));

    let result = h
        .orchestrator
        .rollback(&release.id, "alice", "check")
        .await
        .unwrap();
    assert_eq!(result.reverted_groups, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn full_revert_scope_reports_every_group() {
    let mut config = config();
    config.rolling.observation = "5m".to_string();
    config.rolling.revert_scope = "full".to_string();
    let h = harness_with(config, |router, _, segment| {
        let half = router
            .current(PROJECT, ENV)
            .is_some_and(|split| split.candidate >= 50);
        if segment == Segment::Candidate && half {
            erroring(9.0)
        } else {
            healthy()
        }
    });

    let release = h.orchestrator.create_release(request(Strategy::Rolling)).await.unwrap();
    let done = h.finish(&release.id).await;
    assert_eq!(done.status, ReleaseStatus::RolledBack);
    // Both scopes command the same full revert; only the record differs.
    assert_eq!(h.router.calls().last(), Some(&TrafficSplit::all_stable()));

    let result = h
        .orchestrator
        .rollback(&release.id, "alice", "check")
        .await
        .unwrap();
    assert_eq!(result.reverted_groups, vec![1, 2, 3, 4]);
    let stub = h.store.get_postmortem(&release.id).unwrap().unwrap();
    assert_eq!(stub.reverted_groups, vec![1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn first_traffic_failure_fails_the_release() {
    let h = harness_with(config(), |_, _, _| healthy());
    h.router.fail_next(5);

    let release = h.orchestrator.create_release(request(Strategy::BlueGreen)).await.unwrap();
    let done = h.finish(&release.id).await;
    assert_eq!(done.status, ReleaseStatus::Failed);
    assert!(done.reason.as_deref().unwrap().contains("switch_traffic"));
    assert!(h.store.get_active_release(PROJECT, ENV).unwrap().is_none());

    h.orchestrator.create_release(request(Strategy::BlueGreen)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn recovered_release_does_not_resend_acknowledged_traffic() {
    let h = harness_with(config(), |_, _, _| healthy());

    // Stored as if the process stopped after the router acknowledged the
    // first split but before the release was updated.
    let release = Release {
        id: "rel-recover".to_string(),
        project: PROJECT.to_string(),
        environment: ENV.to_string(),
        artifact: "sha-7f3a9c1".to_string(),
        strategy: Strategy::Canary,
        status: ReleaseStatus::Running,
        risk_score: 3.0,
        traffic: TrafficSplit::all_stable(),
        current_stage: Some("canary_1pct".to_string()),
        step: 0,
        auto_promote: true,
        last_known_good: Some("sha-1b2c3d4".to_string()),
        reason: None,
        created_at: T0,
        updated_at: T0,
    };
    h.store.put_release(&release).unwrap();
    h.store
        .put_stage(&StageRecord {
            scope: release.id.clone(),
            stage: "traffic.canary_1pct".to_string(),
            attempt: 1,
            status: StageStatus::Done,
            result: Some(serde_json::json!({ "traffic": "stable=99 candidate=1" })),
            error: None,
            started_at: T0,
            finished_at: Some(T0),
        })
        .unwrap();

    assert_eq!(h.orchestrator.recover().await.unwrap(), 1);
    assert_eq!(h.orchestrator.recover().await.unwrap(), 0);

    let done = h.finish(&release.id).await;
    assert_eq!(done.status, ReleaseStatus::Completed);
    let pcts: Vec<u8> = h.router.calls().iter().map(|s| s.candidate).collect();
    assert_eq!(pcts, vec![5, 25, 100]);

    let trail = h.orchestrator.audit_trail(&release.id).await.unwrap();
    assert_eq!(trail[0].action, "release.recovered");
    assert!(trail[1].reason.contains("already applied"));
}
