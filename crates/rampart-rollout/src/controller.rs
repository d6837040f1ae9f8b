//! Release controller — one task per active release.
//!
//! The task is the only writer of its release. Operator commands arrive on
//! an mpsc channel with a oneshot reply, health reports arrive from the
//! health monitor, and every committed state is published on a watch
//! channel for readers. A transition is applied to a copy of the machine,
//! audited, persisted, and only then adopted.

use std::sync::Arc;
use std::time::Duration;

use rampart_core::Clock;
use rampart_health::{HealthMonitor, HealthReport, HealthStatus};
use rampart_scheduler::{PipelineScheduler, StageOutcome, stage_op};
use rampart_state::{Release, ReleaseStatus};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditRecorder, HEALTH_ACTOR, SYSTEM_ACTOR};
use crate::error::{RolloutError, RolloutResult};
use crate::events::ProgressEvent;
use crate::machine::{Action, ReleaseMachine};
use crate::notify::{AlertLevel, Notification, Notifier, dispatch};
use crate::rollback::{RollbackEngine, RollbackResult};
use crate::traffic::TrafficRouter;

const COMMAND_CAPACITY: usize = 32;
const REPORT_CAPACITY: usize = 64;

/// Collaborators shared by every controller.
#[derive(Clone)]
pub struct ControllerContext {
    pub recorder: AuditRecorder,
    pub scheduler: PipelineScheduler,
    pub router: Arc<dyn TrafficRouter>,
    pub monitor: Arc<HealthMonitor>,
    pub rollback: RollbackEngine,
    pub notifier: Arc<dyn Notifier>,
    pub events: broadcast::Sender<ProgressEvent>,
    pub clock: Clock,
}

type Reply<T> = oneshot::Sender<RolloutResult<T>>;

enum Command {
    Promote { actor: String, reply: Reply<Release> },
    Pause { actor: String, reply: Reply<Release> },
    Resume { actor: String, reply: Reply<Release> },
    Rollback { actor: String, reason: String, reply: Reply<RollbackResult> },
}

/// Client side of a running controller.
#[derive(Clone)]
pub struct ReleaseHandle {
    id: String,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Release>,
}

impl ReleaseHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Last committed state of the release.
    pub fn snapshot(&self) -> Release {
        self.snapshot.borrow().clone()
    }

    /// The controller task has exited.
    pub fn is_finished(&self) -> bool {
        self.commands.is_closed()
    }

    /// Resolves once the controller task has exited.
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    pub async fn promote(&self, actor: &str) -> RolloutResult<Release> {
        let actor = actor.to_string();
        self.request(|reply| Command::Promote { actor, reply }).await
    }

    pub async fn pause(&self, actor: &str) -> RolloutResult<Release> {
        let actor = actor.to_string();
        self.request(|reply| Command::Pause { actor, reply }).await
    }

    pub async fn resume(&self, actor: &str) -> RolloutResult<Release> {
        let actor = actor.to_string();
        self.request(|reply| Command::Resume { actor, reply }).await
    }

    pub async fn rollback(&self, actor: &str, reason: &str) -> RolloutResult<RollbackResult> {
        let actor = actor.to_string();
        let reason = reason.to_string();
        self.request(|reply| Command::Rollback { actor, reason, reply })
            .await
    }

    /// Wait until the committed release satisfies `done`, or the
    /// controller exits. Returns the last committed state either way.
    pub async fn wait_for<F>(&self, done: F) -> Release
    where
        F: FnMut(&Release) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(done).await.map(|r| r.clone());
        result.unwrap_or_else(|_| self.snapshot())
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> RolloutResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| RolloutError::ControllerGone(self.id.clone()))?;
        rx.await
            .map_err(|_| RolloutError::ControllerGone(self.id.clone()))?
    }
}

/// Outcome of one wait inside the observe or hold loops.
enum Wake {
    Act(Action),
    Continue,
}

pub struct ReleaseController {
    ctx: ControllerContext,
    machine: ReleaseMachine,
    commands: mpsc::Receiver<Command>,
    reports_tx: mpsc::Sender<HealthReport>,
    reports: mpsc::Receiver<HealthReport>,
    snapshot: watch::Sender<Release>,
    rollback_actor: String,
    rollback_waiters: Vec<Reply<RollbackResult>>,
}

impl ReleaseController {
    /// Start a controller for `machine`. A PENDING release is started,
    /// anything else continues from its stored status.
    pub fn spawn(ctx: ControllerContext, machine: ReleaseMachine) -> ReleaseHandle {
        let id = machine.release().id.clone();
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (reports_tx, reports) = mpsc::channel(REPORT_CAPACITY);
        let (snapshot, snapshot_rx) = watch::channel(machine.release().clone());

        let controller = Self {
            ctx,
            machine,
            commands,
            reports_tx,
            reports,
            snapshot,
            rollback_actor: SYSTEM_ACTOR.to_string(),
            rollback_waiters: Vec::new(),
        };
        tokio::spawn(controller.run());

        ReleaseHandle {
            id,
            commands: commands_tx,
            snapshot: snapshot_rx,
        }
    }

    fn id(&self) -> &str {
        &self.machine.release().id
    }

    async fn run(mut self) {
        let id = self.id().to_string();
        debug!(release = %id, status = %self.machine.status(), "controller starting");

        let mut next = self.first_action().await;
        loop {
            let action = match next {
                Ok(Action::Done) => break,
                Ok(action) => action,
                Err(e) => {
                    error!(release = %id, error = %e, "controller stopped");
                    break;
                }
            };
            next = match action {
                Action::SetTraffic { step } => self.set_traffic(step).await,
                Action::Observe { step, window } => self.observe(step, window).await,
                Action::Hold => self.hold().await,
                Action::Finalize => self.finalize().await,
                Action::Rollback { .. } => self.roll_back().await,
                Action::AwaitOperator => self.await_operator().await,
                Action::Done => Ok(Action::Done),
            };
        }

        self.ctx.monitor.stop_monitor(&id).await;
        debug!(release = %id, status = %self.machine.status(), "controller finished");
    }

    async fn first_action(&mut self) -> RolloutResult<Action> {
        if self.machine.status() == ReleaseStatus::Pending {
            return self
                .transition(SYSTEM_ACTOR, "release.transition", "release started", |m, now| {
                    m.start(now)
                })
                .await;
        }
        let now = self.ctx.clock.now_ms();
        let action = self.machine.recover(now)?;
        info!(release = %self.id(), status = %self.machine.status(), ?action, "release recovered");
        self.ctx
            .recorder
            .record(
                &self.machine.release().id,
                AuditEvent::new(SYSTEM_ACTOR, "release.recovered", "controller restarted")
                    .stage(self.machine.release().current_stage.clone()),
            )
            .await?;
        Ok(action)
    }

    /// Send the split for `step` through the scheduler so an acknowledged
    /// split is never sent twice.
    async fn set_traffic(&mut self, step: usize) -> RolloutResult<Action> {
        if let Some(action) = self.drain_commands().await {
            return Ok(action);
        }
        let Some(plan_step) = self.machine.plan().step(step).cloned() else {
            return Ok(Action::Hold);
        };

        let release = self.machine.release().clone();
        let router = self.ctx.router.clone();
        let split = plan_step.split;
        let op = stage_op(move || {
            let router = router.clone();
            let project = release.project.clone();
            let environment = release.environment.clone();
            async move {
                router
                    .set_split(&project, &environment, &split.to_map())
                    .await
                    .map(|_| serde_json::json!({ "traffic": split.to_string() }))
            }
        });

        let stage = format!("traffic.{}", plan_step.stage);
        match self.ctx.scheduler.run_stage(self.id(), &stage, op).await? {
            StageOutcome::Done { cached, .. } => {
                let reason = if cached {
                    format!("{split} already applied")
                } else {
                    format!("{split} applied")
                };
                self.transition(SYSTEM_ACTOR, "traffic.set", &reason, |m, now| {
                    Ok(m.traffic_applied(now))
                })
                .await
            }
            outcome => {
                let message = match outcome.into_result() {
                    Err(e) => e.to_string(),
                    Ok(_) => "no result".to_string(),
                };
                let failure = RolloutError::TransientInfra {
                    stage: plan_step.stage.clone(),
                    message,
                };
                warn!(release = %self.id(), error = %failure, "traffic change failed");
                let reason = failure.to_string();
                if step == 0 {
                    // Nothing has shifted yet, so there is nothing to revert.
                    self.transition(SYSTEM_ACTOR, "release.transition", &reason, |m, now| {
                        Ok(m.fail(&reason, now))
                    })
                    .await
                } else {
                    self.transition(SYSTEM_ACTOR, "release.transition", &reason, |m, now| {
                        m.begin_rollback(&reason, now)
                    })
                    .await
                }
            }
        }
    }

    /// Watch health for `window`. The window only closes once a real
    /// sample has been seen; before that, silence decides.
    async fn observe(&mut self, step: usize, window: Duration) -> RolloutResult<Action> {
        if !self.ctx.monitor.is_monitoring(self.id()).await {
            self.ctx
                .monitor
                .start_monitor(self.id(), self.reports_tx.clone())
                .await;
        }
        debug!(release = %self.id(), step, ?window, "observing");

        let timer = tokio::time::sleep(window);
        tokio::pin!(timer);
        let mut window_closed = false;
        let mut sampled = false;
        let mut latest = HealthStatus::Healthy;

        loop {
            tokio::select! {
                _ = &mut timer, if !window_closed => {
                    window_closed = true;
                    if !sampled {
                        debug!(release = %self.id(), "window elapsed without samples, waiting");
                    }
                }
                Some(report) = self.reports.recv() => {
                    if report.classification.is_breached() {
                        return self.breach(report).await;
                    }
                    if report.sample.is_some() {
                        sampled = true;
                    }
                    latest = report.status();
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Err(RolloutError::ControllerGone(self.id().to_string()));
                    };
                    if let Some(action) = self.handle(command).await {
                        return Ok(action);
                    }
                }
            }

            if window_closed && sampled {
                let reason = format!("observation window ended {latest}");
                return self
                    .transition(SYSTEM_ACTOR, "release.step", &reason, |m, now| {
                        Ok(m.observation_complete(latest, now))
                    })
                    .await;
            }
        }
    }

    /// Wait while PAUSED for a command, a health change, or the DEGRADED
    /// deadline.
    async fn hold(&mut self) -> RolloutResult<Action> {
        loop {
            let wait = self.machine.degraded_deadline().map(|deadline| {
                Duration::from_millis(deadline.saturating_sub(self.ctx.clock.now_ms()))
            });
            let timer = tokio::time::sleep(wait.unwrap_or(Duration::MAX));
            tokio::pin!(timer);

            let wake = tokio::select! {
                _ = &mut timer, if wait.is_some() => {
                    self.transition_opt(SYSTEM_ACTOR, "release.transition", "degraded hold timed out", |m, now| {
                        m.degraded_expired(now)
                    })
                    .await?
                }
                Some(report) = self.reports.recv() => {
                    if report.classification.is_breached() {
                        return self.breach(report).await;
                    }
                    if report.status() == HealthStatus::Healthy && report.sample.is_some() {
                        self.transition_opt(SYSTEM_ACTOR, "release.transition", "health recovered", |m, now| {
                            m.recovered(now)
                        })
                        .await?
                    } else {
                        Wake::Continue
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Err(RolloutError::ControllerGone(self.id().to_string()));
                    };
                    match self.handle(command).await {
                        Some(action) => Wake::Act(action),
                        None => Wake::Continue,
                    }
                }
            };
            if let Wake::Act(action) = wake {
                return Ok(action);
            }
        }
    }

    async fn finalize(&mut self) -> RolloutResult<Action> {
        self.ctx.monitor.stop_monitor(self.id()).await;
        let action = self
            .transition(SYSTEM_ACTOR, "release.transition", "all steps healthy", |m, now| {
                Ok(m.complete(now))
            })
            .await?;
        self.notify(AlertLevel::Info, "release completed", "all traffic on the new release");
        Ok(action)
    }

    async fn roll_back(&mut self) -> RolloutResult<Action> {
        self.ctx.monitor.stop_monitor(self.id()).await;
        let release = self.machine.release().clone();
        let groups = self.machine.plan().groups_to_revert(self.machine.step_index());
        let actor = self.rollback_actor.clone();

        match self.ctx.rollback.revert_traffic(&release).await {
            Ok(()) => {
                let reason = release.reason.clone().unwrap_or_default();
                let action = self
                    .transition(&actor, "release.transition", &reason, |m, now| {
                        Ok(m.rollback_confirmed(now))
                    })
                    .await?;
                let result = self
                    .ctx
                    .rollback
                    .finish(self.machine.release(), groups)
                    .await;
                match result {
                    Ok(result) => {
                        for waiter in self.rollback_waiters.drain(..) {
                            let _ = waiter.send(Ok(result.clone()));
                        }
                    }
                    Err(e) => {
                        error!(release = %release.id, error = %e, "postmortem not written");
                        for waiter in self.rollback_waiters.drain(..) {
                            let _ = waiter.send(Err(RolloutError::InvalidRequest(e.to_string())));
                        }
                    }
                }
                Ok(action)
            }
            Err(RolloutError::RollbackTimeout { release_id, timeout }) => {
                let reason = format!("traffic revert not confirmed within {timeout:?}");
                let action = self
                    .transition(SYSTEM_ACTOR, "release.transition", &reason, |m, now| {
                        Ok(m.escalate(now))
                    })
                    .await?;
                self.ctx.rollback.escalate(self.machine.release());
                for waiter in self.rollback_waiters.drain(..) {
                    let _ = waiter.send(Err(RolloutError::RollbackTimeout {
                        release_id: release_id.clone(),
                        timeout,
                    }));
                }
                Ok(action)
            }
            Err(e) => Err(e),
        }
    }

    /// ESCALATED: only a new rollback request moves the release on.
    async fn await_operator(&mut self) -> RolloutResult<Action> {
        warn!(release = %self.id(), "release escalated, awaiting operator");
        loop {
            tokio::select! {
                Some(_) = self.reports.recv() => {}
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Err(RolloutError::ControllerGone(self.id().to_string()));
                    };
                    if let Some(action) = self.handle(command).await {
                        return Ok(action);
                    }
                }
            }
        }
    }

    async fn breach(&mut self, report: HealthReport) -> RolloutResult<Action> {
        let stage = self.machine.release().current_stage.clone();
        let reason = format!(
            "health breach at {}: {}",
            self.machine.stage_name(),
            report.classification.reason
        );
        self.ctx
            .recorder
            .record(
                self.id(),
                AuditEvent::new(HEALTH_ACTOR, "health.breach", report.classification.reason.clone())
                    .stage(stage),
            )
            .await?;
        self.notify(AlertLevel::Warning, "health breach", reason.clone());
        self.rollback_actor = HEALTH_ACTOR.to_string();
        self.transition(HEALTH_ACTOR, "release.transition", &reason, |m, now| {
            m.begin_rollback(&reason, now)
        })
        .await
    }

    /// Handle queued commands before a step begins.
    async fn drain_commands(&mut self) -> Option<Action> {
        while let Ok(command) = self.commands.try_recv() {
            if let Some(action) = self.handle(command).await {
                return Some(action);
            }
        }
        None
    }

    /// Apply an operator command. Returns the action that replaces the
    /// current one, if the command changed course.
    async fn handle(&mut self, command: Command) -> Option<Action> {
        match command {
            Command::Promote { actor, reply } => {
                let result = self
                    .transition(&actor, "release.promote", "operator promotion", |m, now| {
                        m.promote(now)
                    })
                    .await;
                self.reply(reply, result)
            }
            Command::Pause { actor, reply } => {
                let result = self
                    .transition(&actor, "release.pause", "operator pause", |m, now| m.pause(now))
                    .await;
                self.reply(reply, result)
            }
            Command::Resume { actor, reply } => {
                let result = self
                    .transition(&actor, "release.resume", "operator resume", |m, now| m.resume(now))
                    .await;
                self.reply(reply, result)
            }
            Command::Rollback { actor, reason, reply } => {
                let result = self
                    .transition(&actor, "release.rollback", &reason, |m, now| {
                        m.begin_rollback(&reason, now)
                    })
                    .await;
                match result {
                    Ok(action) => {
                        self.rollback_actor = actor;
                        self.rollback_waiters.push(reply);
                        Some(action)
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        None
                    }
                }
            }
        }
    }

    fn reply(&self, reply: Reply<Release>, result: RolloutResult<Action>) -> Option<Action> {
        match result {
            Ok(action) => {
                let _ = reply.send(Ok(self.machine.release().clone()));
                Some(action)
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                None
            }
        }
    }

    /// Apply `apply` to a copy of the machine, audit the difference,
    /// persist, then adopt the copy.
    async fn transition<F>(&mut self, actor: &str, action: &str, reason: &str, apply: F) -> RolloutResult<Action>
    where
        F: FnOnce(&mut ReleaseMachine, u64) -> RolloutResult<Action>,
    {
        let now = self.ctx.clock.now_ms();
        let mut next = self.machine.clone();
        let outcome = apply(&mut next, now)?;

        let before = self.machine.release();
        let after = next.release();
        let event = AuditEvent::new(actor, action, reason)
            .stage(after.current_stage.clone())
            .diff(describe_diff(before, after));
        self.ctx.recorder.record(&after.id, event).await?;
        self.ctx.recorder.save_release(after).await?;

        self.machine = next;
        let release = self.machine.release().clone();
        let _ = self
            .ctx
            .events
            .send(ProgressEvent::for_release(&release, reason));
        self.snapshot.send_replace(release);
        Ok(outcome)
    }

    /// Like [`transition`](Self::transition) for machine calls that may
    /// decline to act. Nothing is recorded when they do.
    async fn transition_opt<F>(&mut self, actor: &str, action: &str, reason: &str, apply: F) -> RolloutResult<Wake>
    where
        F: FnOnce(&mut ReleaseMachine, u64) -> Option<Action>,
    {
        let now = self.ctx.clock.now_ms();
        let mut probe = self.machine.clone();
        let Some(next_action) = apply(&mut probe, now) else {
            return Ok(Wake::Continue);
        };
        self.transition(actor, action, reason, move |m, _| {
            *m = probe;
            Ok(next_action)
        })
        .await
        .map(Wake::Act)
    }

    fn notify(&self, level: AlertLevel, title: &str, message: impl Into<String>) {
        let now = self.ctx.clock.now_ms();
        dispatch(
            &self.ctx.notifier,
            Notification::about(self.machine.release(), level, title, message, now),
        );
    }
}

/// Short description of what a transition changed, e.g.
/// `running -> paused` or `canary_1pct -> canary_5pct`.
fn describe_diff(before: &Release, after: &Release) -> String {
    let mut parts = Vec::new();
    if before.status != after.status {
        parts.push(format!("{} -> {}", before.status, after.status));
    }
    if before.current_stage != after.current_stage {
        parts.push(format!(
            "{} -> {}",
            before.current_stage.as_deref().unwrap_or("none"),
            after.current_stage.as_deref().unwrap_or("none")
        ));
    }
    if before.traffic != after.traffic {
        parts.push(format!(
            "{}/{} -> {}/{}",
            before.traffic.stable, before.traffic.candidate, after.traffic.stable, after.traffic.candidate
        ));
    }
    if parts.is_empty() {
        "unchanged".to_string()
    } else {
        parts.join(", ")
    }
}
