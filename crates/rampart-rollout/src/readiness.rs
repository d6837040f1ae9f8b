//! Readiness gate — the policy evaluator plus durable waivers and check
//! collection.
//!
//! When a [`CheckSource`] is configured the checks are measured as one
//! scheduler DAG, a stage per check, so independent measurements run
//! concurrently and transient failures are retried.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rampart_core::Clock;
use rampart_policy::{CheckResult, PolicyCheck, PolicyEvaluator, ReadinessReport};
use rampart_scheduler::{Dag, PipelineScheduler, StageError, StageOutcome, stage_op};
use rampart_state::{StateStore, WaiverRecord};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::RolloutResult;

/// Produces the measurement for one readiness check.
#[async_trait]
pub trait CheckSource: Send + Sync {
    async fn measure(&self, project: &str, check: &PolicyCheck) -> Result<CheckResult, StageError>;
}

struct GateState {
    evaluator: PolicyEvaluator,
    /// Projects whose stored waivers are loaded into the evaluator.
    restored: HashSet<String>,
}

pub struct ReadinessGate {
    state: Mutex<GateState>,
    store: StateStore,
    scheduler: PipelineScheduler,
    source: Option<Arc<dyn CheckSource>>,
    clock: Clock,
    runs: AtomicU64,
}

impl ReadinessGate {
    pub fn new(checks: Vec<PolicyCheck>, store: StateStore, scheduler: PipelineScheduler, clock: Clock) -> Self {
        Self {
            state: Mutex::new(GateState {
                evaluator: PolicyEvaluator::new(checks),
                restored: HashSet::new(),
            }),
            store,
            scheduler,
            source: None,
            clock,
            runs: AtomicU64::new(0),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn CheckSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub async fn checks(&self) -> Vec<PolicyCheck> {
        self.state.lock().await.evaluator.checks().to_vec()
    }

    /// Evaluate supplied results for `project`.
    pub async fn evaluate(&self, project: &str, results: &[CheckResult]) -> RolloutResult<ReadinessReport> {
        let mut state = self.state.lock().await;
        self.restore(&mut state, project)?;
        Ok(state.evaluator.evaluate(project, results, self.clock.now_ms()))
    }

    /// Report used to admit a release. Supplied results win; otherwise the
    /// checks are measured through the source, or the last evaluation is
    /// re-derived at the current time.
    pub async fn gate(&self, project: &str, results: Option<&[CheckResult]>) -> RolloutResult<ReadinessReport> {
        if let Some(results) = results {
            return self.evaluate(project, results).await;
        }
        if self.source.is_some() {
            let collected = self.collect(project).await?;
            return self.evaluate(project, &collected).await;
        }
        match self.current_report(project).await? {
            Some(report) => Ok(report),
            None => self.evaluate(project, &[]).await,
        }
    }

    /// Last report for `project`, re-derived so lapsed waivers count.
    pub async fn current_report(&self, project: &str) -> RolloutResult<Option<ReadinessReport>> {
        let mut state = self.state.lock().await;
        self.restore(&mut state, project)?;
        Ok(state.evaluator.reevaluate(project, self.clock.now_ms()))
    }

    /// Waive a failing check and persist the waiver.
    pub async fn waive(
        &self,
        project: &str,
        check: &str,
        reason: &str,
        waived_by: &str,
        expires_at: u64,
    ) -> RolloutResult<WaiverRecord> {
        let mut state = self.state.lock().await;
        self.restore(&mut state, project)?;
        let now = self.clock.now_ms();
        let waiver = state
            .evaluator
            .waive(project, check, reason, waived_by, expires_at, now)?;
        self.store.put_waiver(&waiver)?;
        Ok(waiver)
    }

    /// Measure every check through the source as one DAG run. A check
    /// whose measurement fails is left out and so blocks.
    pub async fn collect(&self, project: &str) -> RolloutResult<Vec<CheckResult>> {
        let Some(source) = self.source.clone() else {
            return Ok(Vec::new());
        };
        let checks = self.checks().await;

        let mut dag = Dag::new();
        for check in &checks {
            let source = source.clone();
            let project = project.to_string();
            let check = check.clone();
            dag = dag.stage(
                &check.name.clone(),
                &[],
                stage_op(move || {
                    let source = source.clone();
                    let project = project.clone();
                    let check = check.clone();
                    async move {
                        let result = source.measure(&project, &check).await?;
                        serde_json::to_value(&result).map_err(|e| StageError::permanent(e.to_string()))
                    }
                }),
            );
        }

        let run = self.runs.fetch_add(1, Ordering::Relaxed);
        let scope = format!("readiness/{project}/{}-{run}", self.clock.now_ms());
        let outcome = self.scheduler.run(&dag, &scope).await?;

        let mut results = Vec::with_capacity(checks.len());
        for (stage, outcome) in outcome.stages {
            match outcome {
                StageOutcome::Done { value, .. } => match serde_json::from_value(value) {
                    Ok(result) => results.push(result),
                    Err(e) => warn!(%project, %stage, error = %e, "unreadable check result"),
                },
                other => warn!(%project, %stage, outcome = ?other, "check not measured"),
            }
        }
        info!(%project, measured = results.len(), total = checks.len(), "readiness checks collected");
        Ok(results)
    }

    fn restore(&self, state: &mut GateState, project: &str) -> RolloutResult<()> {
        if state.restored.contains(project) {
            return Ok(());
        }
        let waivers = self.store.list_waivers(project)?;
        debug!(%project, count = waivers.len(), "waivers restored");
        for waiver in waivers {
            state.evaluator.restore_waiver(waiver);
        }
        state.restored.insert(project.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use rampart_core::PolicySection;
    use rampart_policy::{
        COMPLIANCE_CHECK, COST_BUDGET, Measurement, PERFORMANCE_BUDGET, SECURITY_SCAN, TEST_COVERAGE,
        default_checks,
    };
    use rampart_scheduler::RetryPolicy;

    use super::*;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: Some(3),
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            jitter: false,
        }
    }

    fn gate(store: &StateStore) -> ReadinessGate {
        let clock = Clock::anchored_at(1_000);
        let scheduler = PipelineScheduler::new(store.clone(), policy(), clock);
        ReadinessGate::new(default_checks(&PolicySection::default()), store.clone(), scheduler, clock)
    }

    fn results(coverage: f64) -> Vec<CheckResult> {
        vec![
            CheckResult::new(TEST_COVERAGE, Measurement::Coverage { percent: coverage }),
            CheckResult::new(
                SECURITY_SCAN,
                Measurement::Vulnerabilities { critical: 0, high: 0, medium: 0, low: 0 },
            ),
            CheckResult::new(
                PERFORMANCE_BUDGET,
                Measurement::Performance { p95_ms: 120.0, error_rate_percent: 0.1 },
            ),
            CheckResult::new(COST_BUDGET, Measurement::CostDelta { percent: 0.0 }),
            CheckResult::new(COMPLIANCE_CHECK, Measurement::Compliance { failed_controls: vec![] }),
        ]
    }

    /// Healthy measurements, with the first coverage attempt failing
    /// transiently.
    struct Flaky {
        coverage_calls: AtomicU32,
    }

    #[async_trait]
    impl CheckSource for Flaky {
        async fn measure(&self, _project: &str, check: &PolicyCheck) -> Result<CheckResult, StageError> {
            if check.name == TEST_COVERAGE && self.coverage_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StageError::transient("coverage service warming up"));
            }
            if check.name == COST_BUDGET {
                return Err(StageError::permanent("billing export missing"));
            }
            results(95.0)
                .into_iter()
                .find(|r| r.check == check.name)
                .ok_or_else(|| StageError::permanent("unknown check"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waivers_survive_a_new_gate() {
        let store = StateStore::open_in_memory().unwrap();
        let first = gate(&store);
        assert!(!first.evaluate("shop", &results(72.0)).await.unwrap().ready);
        first
            .waive("shop", TEST_COVERAGE, "legacy module", "ops", 1_000 + DAY_MS)
            .await
            .unwrap();
        assert!(first.current_report("shop").await.unwrap().unwrap().ready);

        let second = gate(&store);
        let report = second.evaluate("shop", &results(72.0)).await.unwrap();
        assert!(report.ready);
        assert_eq!(report.waived, vec![TEST_COVERAGE.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_without_results_or_source_blocks_everything() {
        let store = StateStore::open_in_memory().unwrap();
        let report = gate(&store).gate("shop", None).await.unwrap();
        assert!(!report.ready);
        assert_eq!(report.blockers.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_reuses_the_last_evaluation() {
        let store = StateStore::open_in_memory().unwrap();
        let gate = gate(&store);
        gate.evaluate("shop", &results(90.0)).await.unwrap();
        assert!(gate.gate("shop", None).await.unwrap().ready);
    }

    #[tokio::test(start_paused = true)]
    async fn collect_runs_checks_through_the_scheduler() {
        let store = StateStore::open_in_memory().unwrap();
        let source = Arc::new(Flaky {
            coverage_calls: AtomicU32::new(0),
        });
        let gate = gate(&store).with_source(source.clone());

        let report = gate.gate("shop", None).await.unwrap();
        assert_eq!(source.coverage_calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.blockers, vec![COST_BUDGET.to_string()]);
        assert_eq!(report.check(COST_BUDGET).unwrap().message, "no result supplied");
    }
}
