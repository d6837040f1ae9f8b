//! Rollback engine — returns all traffic to the last-known-good release.
//!
//! The revert goes through the scheduler as the `rollback.revert_traffic`
//! stage of the release, so a revert the router already acknowledged is
//! never sent twice. Transient router failures are retried until the
//! rollback timeout, after which the release is escalated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rampart_core::Clock;
use rampart_scheduler::{PipelineScheduler, StageOutcome, stage_op};
use rampart_state::{PostmortemStub, Release, ReleaseStore, TrafficSplit};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{RolloutError, RolloutResult};
use crate::notify::{AlertLevel, Notification, Notifier, dispatch};
use crate::traffic::TrafficRouter;

pub const REVERT_STAGE: &str = "rollback.revert_traffic";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub release_id: String,
    pub reason: String,
    /// Artifact now serving all traffic.
    pub restored_artifact: Option<String>,
    pub traffic: TrafficSplit,
    /// Instance groups reverted (rolling releases only).
    pub reverted_groups: Vec<u32>,
    pub postmortem_id: String,
    pub completed_at: u64,
}

#[derive(Clone)]
pub struct RollbackEngine {
    scheduler: PipelineScheduler,
    router: Arc<dyn TrafficRouter>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn ReleaseStore>,
    clock: Clock,
    timeout: Duration,
    results: Arc<Mutex<HashMap<String, RollbackResult>>>,
}

impl RollbackEngine {
    pub fn new(
        scheduler: PipelineScheduler,
        router: Arc<dyn TrafficRouter>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn ReleaseStore>,
        clock: Clock,
        timeout: Duration,
    ) -> Self {
        Self {
            scheduler,
            router,
            notifier,
            store,
            clock,
            timeout,
            results: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set stable 100 / candidate 0 and wait for the router to confirm.
    pub async fn revert_traffic(&self, release: &Release) -> RolloutResult<()> {
        let router = self.router.clone();
        let project = release.project.clone();
        let environment = release.environment.clone();
        let split = TrafficSplit::all_stable();
        let op = stage_op(move || {
            let router = router.clone();
            let project = project.clone();
            let environment = environment.clone();
            async move {
                router
                    .set_split(&project, &environment, &split.to_map())
                    .await
                    .map(|_| serde_json::json!({ "traffic": split.to_string() }))
            }
        });

        let policy = self.scheduler.policy().unbounded();
        let run = self
            .scheduler
            .run_stage_with(&release.id, REVERT_STAGE, op, &policy);
        match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(StageOutcome::Done { cached, .. })) => {
                info!(release = %release.id, cached, "traffic reverted to stable");
                Ok(())
            }
            Ok(Ok(other)) => {
                // Permanent router rejection: nothing will change by waiting.
                warn!(release = %release.id, outcome = ?other, "traffic revert rejected");
                Err(RolloutError::RollbackTimeout {
                    release_id: release.id.clone(),
                    timeout: self.timeout,
                })
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                error!(release = %release.id, timeout = ?self.timeout, "traffic revert not confirmed in time");
                Err(RolloutError::RollbackTimeout {
                    release_id: release.id.clone(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Write the postmortem stub, notify, and remember the result for
    /// repeated calls. `release` must already be ROLLED_BACK.
    pub async fn finish(&self, release: &Release, reverted_groups: Vec<u32>) -> RolloutResult<RollbackResult> {
        let reason = release.reason.clone().unwrap_or_default();
        let trail = self.store.audit_trail(&release.id)?;
        let now = self.clock.now_ms();
        let stub = PostmortemStub {
            id: format!("pm-{}", release.id),
            release_id: release.id.clone(),
            reason: reason.clone(),
            timeline: trail
                .iter()
                .map(|e| format!("#{} {} {} ({})", e.seq, e.timestamp, e.action, e.reason))
                .collect(),
            root_cause: "to be completed by the release owner".to_string(),
            audit_refs: trail.iter().map(|e| e.seq).collect(),
            reverted_groups: reverted_groups.clone(),
            created_at: now,
        };
        self.store.save_postmortem(&stub)?;

        let result = RollbackResult {
            release_id: release.id.clone(),
            reason: reason.clone(),
            restored_artifact: release.last_known_good.clone(),
            traffic: TrafficSplit::all_stable(),
            reverted_groups,
            postmortem_id: stub.id,
            completed_at: now,
        };
        if let Ok(mut results) = self.results.lock() {
            results.insert(release.id.clone(), result.clone());
        }

        self.send(release, AlertLevel::Warning, "release rolled back", reason);
        Ok(result)
    }

    /// Alert that a rollback needs a human.
    pub fn escalate(&self, release: &Release) {
        self.send(
            release,
            AlertLevel::Critical,
            "rollback not confirmed",
            format!(
                "traffic revert not confirmed within {:?}; manual intervention required",
                self.timeout
            ),
        );
    }

    /// Result of an earlier rollback, rebuilt from the postmortem if this
    /// process did not perform it.
    pub fn prior_result(&self, release: &Release) -> RolloutResult<Option<RollbackResult>> {
        if let Some(result) = self
            .results
            .lock()
            .ok()
            .and_then(|r| r.get(&release.id).cloned())
        {
            return Ok(Some(result));
        }
        let Some(stub) = self.store.load_postmortem(&release.id)? else {
            return Ok(None);
        };
        Ok(Some(RollbackResult {
            release_id: release.id.clone(),
            reason: stub.reason,
            restored_artifact: release.last_known_good.clone(),
            traffic: TrafficSplit::all_stable(),
            reverted_groups: stub.reverted_groups,
            postmortem_id: stub.id,
            completed_at: stub.created_at,
        }))
    }

    fn send(&self, release: &Release, level: AlertLevel, title: &str, message: String) {
        let at = self.clock.now_ms();
        dispatch(&self.notifier, Notification::about(release, level, title, message, at));
    }
}

#[cfg(test)]
mod tests {
    use rampart_scheduler::RetryPolicy;
    use rampart_state::{ReleaseStatus, StateStore, Strategy};

    use super::*;
    use crate::notify::LogNotifier;
    use crate::traffic::InMemoryRouter;

    fn engine(store: &StateStore) -> RollbackEngine {
        let clock = Clock::anchored_at(5_000);
        let policy = RetryPolicy {
            max_attempts: None,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            jitter: false,
        };
        RollbackEngine::new(
            PipelineScheduler::new(store.clone(), policy, clock),
            Arc::new(InMemoryRouter::new()),
            Arc::new(LogNotifier),
            Arc::new(store.clone()),
            clock,
            Duration::from_secs(180),
        )
    }

    fn rolled_back() -> Release {
        Release {
            id: "rel-1".to_string(),
            project: "shop".to_string(),
            environment: "production".to_string(),
            artifact: "sha-new".to_string(),
            strategy: Strategy::Rolling,
            status: ReleaseStatus::RolledBack,
            risk_score: 5.0,
            traffic: TrafficSplit::all_stable(),
            current_stage: Some("group_2_of_4".to_string()),
            step: 1,
            auto_promote: true,
            last_known_good: Some("sha-old".to_string()),
            reason: Some("health breach at group_2_of_4".to_string()),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn prior_result_survives_a_restart() {
        let store = StateStore::open_in_memory().unwrap();
        let release = rolled_back();
        let first = engine(&store).finish(&release, vec![1, 2]).await.unwrap();

        let restarted = engine(&store);
        let prior = restarted.prior_result(&release).unwrap().unwrap();
        assert_eq!(prior.reverted_groups, vec![1, 2]);
        assert_eq!(prior, first);
    }

    #[tokio::test(start_paused = true)]
    async fn no_prior_result_before_rollback() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(engine(&store).prior_result(&rolled_back()).unwrap(), None);
    }
}
