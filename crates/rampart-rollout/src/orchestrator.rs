//! ReleaseOrchestrator — the operations exposed to callers.
//!
//! Admission (readiness gate, one active release per project environment,
//! forced supersede) happens under a single registry lock. After
//! admission each release is driven by its own controller task.

use std::sync::Arc;

use rampart_core::{Clock, RampartConfig};
use rampart_health::{HealthMonitor, MetricsSource};
use rampart_policy::{CheckResult, ReadinessReport, default_checks, hour_of_day_utc, risk_score};
use rampart_scheduler::{PipelineScheduler, RetryPolicy};
use rampart_state::{
    AuditEntry, Release, ReleaseStatus, ReleaseStore, StateStore, Strategy, TrafficSplit,
    WaiverRecord, env_key,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditRecorder};
use crate::controller::{ControllerContext, ReleaseController, ReleaseHandle};
use crate::error::{RolloutError, RolloutResult};
use crate::events::{self, ProgressEvent};
use crate::machine::ReleaseMachine;
use crate::notify::Notifier;
use crate::readiness::{CheckSource, ReadinessGate};
use crate::registry::{Admissions, Registry};
use crate::rollback::{RollbackEngine, RollbackResult};
use crate::strategy::RolloutSettings;
use crate::traffic::TrafficRouter;

fn default_actor() -> String {
    "api".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateReleaseRequest {
    pub project: String,
    pub environment: String,
    pub artifact: String,
    pub strategy: Strategy,
    /// Overrides `canary.auto_promote` for this release.
    #[serde(default)]
    pub auto_promote: Option<bool>,
    /// Defaults to the artifact of the last completed release.
    #[serde(default)]
    pub last_known_good: Option<String>,
    /// Roll back an active release for the same environment first.
    #[serde(default)]
    pub force: bool,
    /// Readiness results. When absent the gate measures or reuses the last
    /// evaluation.
    #[serde(default)]
    pub check_results: Option<Vec<CheckResult>>,
    #[serde(default = "default_actor")]
    pub requested_by: String,
}

/// External systems the orchestrator drives.
pub struct Collaborators {
    pub router: Arc<dyn TrafficRouter>,
    pub metrics: Arc<dyn MetricsSource>,
    pub notifier: Arc<dyn Notifier>,
    /// Audit and release persistence. Defaults to the state store.
    pub release_store: Option<Arc<dyn ReleaseStore>>,
    pub checks: Option<Arc<dyn CheckSource>>,
}

impl Collaborators {
    pub fn new(
        router: Arc<dyn TrafficRouter>,
        metrics: Arc<dyn MetricsSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            router,
            metrics,
            notifier,
            release_store: None,
            checks: None,
        }
    }

    pub fn with_release_store(mut self, store: Arc<dyn ReleaseStore>) -> Self {
        self.release_store = Some(store);
        self
    }

    pub fn with_check_source(mut self, checks: Arc<dyn CheckSource>) -> Self {
        self.checks = Some(checks);
        self
    }
}

pub struct ReleaseOrchestrator {
    ctx: ControllerContext,
    settings: RolloutSettings,
    releases: Arc<dyn ReleaseStore>,
    readiness: ReadinessGate,
    registry: Mutex<Registry>,
    admissions: Admissions,
}

impl ReleaseOrchestrator {
    pub fn new(
        config: &RampartConfig,
        store: StateStore,
        collaborators: Collaborators,
        clock: Clock,
    ) -> RolloutResult<Self> {
        let settings = RolloutSettings::from_config(config)?;
        let retry = RetryPolicy::from_config(&config.scheduler)?;
        let scheduler = PipelineScheduler::new(store.clone(), retry.clone(), clock);
        let releases: Arc<dyn ReleaseStore> = collaborators
            .release_store
            .unwrap_or_else(|| Arc::new(store.clone()));
        let monitor = HealthMonitor::from_config(collaborators.metrics, &config.health, clock)?;

        let rollback = RollbackEngine::new(
            scheduler.clone(),
            collaborators.router.clone(),
            collaborators.notifier.clone(),
            releases.clone(),
            clock,
            settings.rollback_timeout,
        );
        let mut readiness = ReadinessGate::new(
            default_checks(&config.policy),
            store,
            scheduler.clone(),
            clock,
        );
        if let Some(checks) = collaborators.checks {
            readiness = readiness.with_source(checks);
        }

        let ctx = ControllerContext {
            recorder: AuditRecorder::new(releases.clone(), &retry, clock),
            scheduler,
            router: collaborators.router,
            monitor: Arc::new(monitor),
            rollback,
            notifier: collaborators.notifier,
            events: events::channel(),
            clock,
        };

        Ok(Self {
            ctx,
            settings,
            releases,
            readiness,
            registry: Mutex::new(Registry::new()),
            admissions: Admissions::new(),
        })
    }

    pub fn settings(&self) -> &RolloutSettings {
        &self.settings
    }

    /// Admit and start a release.
    pub async fn create_release(&self, request: CreateReleaseRequest) -> RolloutResult<Release> {
        for (field, value) in [
            ("project", &request.project),
            ("environment", &request.environment),
            ("artifact", &request.artifact),
        ] {
            if value.trim().is_empty() {
                return Err(RolloutError::InvalidRequest(format!("{field} must not be empty")));
            }
        }
        // `/` separates project from environment in the active-release key.
        for (field, value) in [("project", &request.project), ("environment", &request.environment)] {
            if value.contains('/') {
                return Err(RolloutError::InvalidRequest(format!("{field} must not contain '/'")));
            }
        }

        let report = self
            .readiness
            .gate(&request.project, request.check_results.as_deref())
            .await?;
        if !report.ready {
            warn!(project = %request.project, blockers = ?report.blockers, "release blocked by policy");
            return Err(RolloutError::PolicyBlocked {
                project: request.project.clone(),
                blockers: report.blockers.clone(),
                details: report.blocker_details(),
            });
        }

        let key = env_key(&request.project, &request.environment);
        let id = new_release_id(self.ctx.clock.now_ms());

        // The environment is claimed under the registry lock; everything
        // after that, including a superseded rollback, runs without it.
        let (prior, admission) = {
            let mut registry = self.registry.lock().await;
            if let Some(admitting) = self.admissions.holder(&key) {
                return Err(RolloutError::ActiveReleaseExists {
                    project: request.project.clone(),
                    environment: request.environment.clone(),
                    release_id: admitting,
                });
            }
            let prior = self.active_handle(&mut registry, &key, &request)?;
            if let Some(prior) = &prior {
                if !request.force {
                    return Err(RolloutError::ActiveReleaseExists {
                        project: request.project.clone(),
                        environment: request.environment.clone(),
                        release_id: prior.id().to_string(),
                    });
                }
            }
            (prior, self.admissions.claim(&key, &id))
        };

        if let Some(prior) = prior {
            info!(release = %prior.id(), superseded_by = %id, "rolling back superseded release");
            prior
                .rollback(&request.requested_by, &format!("superseded by {id}"))
                .await?;
        }

        let now = self.ctx.clock.now_ms();
        let plan = self.settings.plan(request.strategy, request.auto_promote);
        let last_known_good = match request.last_known_good.clone() {
            Some(artifact) => Some(artifact),
            None => self.last_completed_artifact(&request.project, &request.environment)?,
        };
        let release = Release {
            id: id.clone(),
            project: request.project.clone(),
            environment: request.environment.clone(),
            artifact: request.artifact.clone(),
            strategy: request.strategy,
            status: ReleaseStatus::Pending,
            risk_score: risk_score(request.strategy, &request.environment, hour_of_day_utc(now)),
            traffic: TrafficSplit::all_stable(),
            current_stage: None,
            step: 0,
            auto_promote: !plan.manual_promotion,
            last_known_good,
            reason: None,
            created_at: now,
            updated_at: now,
        };

        let mut reason = format!("{} release of {}", release.strategy, release.artifact);
        if !report.waived.is_empty() {
            reason.push_str(&format!(" (waived: {})", report.waived.join(", ")));
        }
        self.ctx
            .recorder
            .record(&id, AuditEvent::new(&request.requested_by, "release.created", reason))
            .await?;
        self.ctx.recorder.save_release(&release).await?;
        info!(
            release = %id,
            project = %release.project,
            env = %release.environment,
            strategy = %release.strategy,
            risk = release.risk_score,
            "release admitted"
        );

        let handle = ReleaseController::spawn(self.ctx.clone(), ReleaseMachine::new(release.clone(), plan));
        self.registry.lock().await.insert(key, handle);
        drop(admission);
        Ok(release)
    }

    pub async fn get_release_status(&self, release_id: &str) -> RolloutResult<Release> {
        if let Some(handle) = self.handle(release_id).await {
            return Ok(handle.snapshot());
        }
        self.releases
            .load_release(release_id)?
            .ok_or_else(|| RolloutError::ReleaseNotFound(release_id.to_string()))
    }

    pub async fn promote(&self, release_id: &str, actor: &str) -> RolloutResult<Release> {
        self.live_handle(release_id, "promote").await?.promote(actor).await
    }

    pub async fn pause(&self, release_id: &str, actor: &str) -> RolloutResult<Release> {
        self.live_handle(release_id, "pause").await?.pause(actor).await
    }

    pub async fn resume(&self, release_id: &str, actor: &str) -> RolloutResult<Release> {
        self.live_handle(release_id, "resume").await?.resume(actor).await
    }

    /// Roll a release back. Calling it again on a ROLLED_BACK release
    /// returns the earlier result without touching traffic.
    pub async fn rollback(&self, release_id: &str, actor: &str, reason: &str) -> RolloutResult<RollbackResult> {
        if let Some(handle) = self.handle(release_id).await {
            if !handle.snapshot().is_terminal() {
                match handle.rollback(actor, reason).await {
                    Err(RolloutError::ControllerGone(_)) => {}
                    other => return other,
                }
            }
            // The postmortem is written after the terminal state is published.
            handle.closed().await;
        }

        let release = self.get_release_status(release_id).await?;
        if release.status == ReleaseStatus::RolledBack {
            if let Some(prior) = self.ctx.rollback.prior_result(&release)? {
                info!(release = %release_id, "already rolled back, returning prior result");
                return Ok(prior);
            }
        }
        Err(RolloutError::InvalidTransition {
            release_id: release_id.to_string(),
            command: "rollback".to_string(),
            status: release.status,
        })
    }

    /// Current readiness of a project, if it was ever evaluated.
    pub async fn get_readiness(&self, project: &str) -> RolloutResult<Option<ReadinessReport>> {
        self.readiness.current_report(project).await
    }

    pub async fn evaluate_readiness(&self, project: &str, results: &[CheckResult]) -> RolloutResult<ReadinessReport> {
        self.readiness.evaluate(project, results).await
    }

    pub async fn waive_policy_check(
        &self,
        project: &str,
        check: &str,
        reason: &str,
        waived_by: &str,
        expires_at: u64,
    ) -> RolloutResult<WaiverRecord> {
        self.readiness
            .waive(project, check, reason, waived_by, expires_at)
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.ctx.events.subscribe()
    }

    /// Every stored release, newest first.
    pub async fn list_releases(&self) -> RolloutResult<Vec<Release>> {
        let mut releases = self.releases.list_releases()?;
        let registry = self.registry.lock().await;
        for release in &mut releases {
            if let Some(handle) = registry.get(&release.id) {
                *release = handle.snapshot();
            }
        }
        releases.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(releases)
    }

    pub async fn audit_trail(&self, release_id: &str) -> RolloutResult<Vec<AuditEntry>> {
        let trail = self.ctx.recorder.trail(release_id)?;
        if trail.is_empty() {
            self.get_release_status(release_id).await?;
        }
        Ok(trail)
    }

    /// Restart controllers for every non-terminal release in the store.
    pub async fn recover(&self) -> RolloutResult<usize> {
        let mut registry = self.registry.lock().await;
        let mut resumed = 0;
        for release in self.releases.list_releases()? {
            if release.is_terminal() || registry.contains(&release.id) {
                continue;
            }
            info!(release = %release.id, status = %release.status, "resuming release");
            self.attach(&mut registry, release);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Handle of a release admitted or recovered by this orchestrator.
    pub async fn handle(&self, release_id: &str) -> Option<ReleaseHandle> {
        self.registry.lock().await.get(release_id).cloned()
    }

    /// Stop health polling. Controllers stop with the runtime.
    pub async fn shutdown(&self) {
        let active = {
            let registry = self.registry.lock().await;
            registry.handles().filter(|h| !h.is_finished()).count()
        };
        info!(active, "orchestrator shutting down");
        self.ctx.monitor.stop_all().await;
    }

    fn attach(&self, registry: &mut Registry, release: Release) -> ReleaseHandle {
        let plan = self.settings.plan(release.strategy, Some(release.auto_promote));
        let key = release.env_key();
        let handle = ReleaseController::spawn(self.ctx.clone(), ReleaseMachine::new(release, plan));
        registry.insert(key, handle.clone());
        handle
    }

    /// The active release for the request's environment. A release the
    /// store holds active without a controller is resumed first.
    fn active_handle(
        &self,
        registry: &mut Registry,
        key: &str,
        request: &CreateReleaseRequest,
    ) -> RolloutResult<Option<ReleaseHandle>> {
        if let Some(handle) = registry.active(key) {
            return Ok(Some(handle.clone()));
        }
        let stored = self
            .releases
            .load_active_release(&request.project, &request.environment)?;
        Ok(stored
            .filter(|r| !r.is_terminal())
            .map(|r| self.attach(registry, r)))
    }

    async fn live_handle(&self, release_id: &str, command: &str) -> RolloutResult<ReleaseHandle> {
        if let Some(handle) = self.handle(release_id).await {
            if !handle.is_finished() && !handle.snapshot().is_terminal() {
                return Ok(handle);
            }
        }
        let release = self.get_release_status(release_id).await?;
        Err(RolloutError::InvalidTransition {
            release_id: release_id.to_string(),
            command: command.to_string(),
            status: release.status,
        })
    }

    fn last_completed_artifact(&self, project: &str, environment: &str) -> RolloutResult<Option<String>> {
        Ok(self
            .releases
            .list_releases()?
            .into_iter()
            .filter(|r| {
                r.project == project && r.environment == environment && r.status == ReleaseStatus::Completed
            })
            .max_by_key(|r| r.updated_at)
            .map(|r| r.artifact))
    }
}

/// `rel-<millis>-<6 hex>`; sorts by creation time.
fn new_release_id(now_ms: u64) -> String {
    format!("rel-{now_ms}-{:06x}", rand::random::<u32>() & 0x00ff_ffff)
}
