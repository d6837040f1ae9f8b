//! Release state machine — pure transitions over a [`Release`].
//!
//! The machine never performs I/O. Each transition mutates the release
//! record and returns the [`Action`] the controller must carry out next.
//! The controller applies transitions to a copy, audits the difference,
//! and only then adopts the copy.

use std::time::Duration;

use rampart_health::HealthStatus;
use rampart_state::{Release, ReleaseStatus, TrafficSplit};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RolloutError, RolloutResult};
use crate::strategy::{PlanStep, RolloutPlan};

/// Why a release is paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HoldReason {
    /// The observation window ended DEGRADED.
    Degraded { since: u64 },
    /// Healthy window with automatic promotion disabled.
    AwaitingPromotion,
    /// Paused by an operator.
    Operator,
}

/// Next thing the controller has to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send the split of plan step `step` to the router.
    SetTraffic { step: usize },
    /// Watch health for `window` before deciding on the step.
    Observe { step: usize, window: Duration },
    /// Wait for a command or a health change.
    Hold,
    /// Status is PROMOTING; finish with [`ReleaseMachine::complete`].
    Finalize,
    /// Status is ROLLING_BACK; hand over to the rollback engine.
    Rollback { reason: String },
    /// Escalated; only an operator rollback moves it on.
    AwaitOperator,
    /// Terminal.
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseMachine {
    release: Release,
    plan: RolloutPlan,
    hold: Option<HoldReason>,
}

impl ReleaseMachine {
    pub fn new(release: Release, plan: RolloutPlan) -> Self {
        Self {
            release,
            plan,
            hold: None,
        }
    }

    pub fn release(&self) -> &Release {
        &self.release
    }

    pub fn plan(&self) -> &RolloutPlan {
        &self.plan
    }

    pub fn status(&self) -> ReleaseStatus {
        self.release.status
    }

    pub fn hold(&self) -> Option<&HoldReason> {
        self.hold.as_ref()
    }

    pub fn step_index(&self) -> usize {
        self.release.step as usize
    }

    pub fn current_step(&self) -> Option<&PlanStep> {
        self.plan.step(self.step_index())
    }

    /// Begin the first step.
    pub fn start(&mut self, now: u64) -> RolloutResult<Action> {
        self.require("start", &[ReleaseStatus::Pending])?;
        if self.plan.steps.is_empty() {
            return Err(RolloutError::InvalidRequest("rollout plan has no steps".to_string()));
        }
        self.release.status = ReleaseStatus::Running;
        self.enter_step(0, now);
        info!(
            release = %self.release.id,
            strategy = %self.release.strategy,
            steps = self.plan.steps.len(),
            "release started"
        );
        Ok(Action::SetTraffic { step: 0 })
    }

    /// The router acknowledged the split for the current step.
    pub fn traffic_applied(&mut self, now: u64) -> Action {
        let index = self.step_index();
        let Some(step) = self.plan.step(index).cloned() else {
            return Action::Hold;
        };
        let window = step.observation;
        self.release.traffic = step.split;
        self.touch(now);
        debug!(release = %self.release.id, stage = %step.stage, traffic = %step.split, "traffic applied");
        Action::Observe { step: index, window }
    }

    /// The observation window of the current step ended with `health`.
    pub fn observation_complete(&mut self, health: HealthStatus, now: u64) -> Action {
        if self.release.status != ReleaseStatus::Running {
            return Action::Hold;
        }
        let index = self.step_index();
        let stage = self.stage_name();
        match health {
            HealthStatus::Breached => self.enter_rollback(format!("health breach at {stage}"), now),
            HealthStatus::Degraded if self.plan.hold_on_degraded => {
                warn!(release = %self.release.id, %stage, "holding release, health degraded");
                self.enter_hold(HoldReason::Degraded { since: now }, now);
                Action::Hold
            }
            _ if self.plan.is_last(index) => self.enter_promoting(now),
            _ if self.plan.manual_promotion => {
                info!(release = %self.release.id, %stage, "step healthy, awaiting promotion");
                self.enter_hold(HoldReason::AwaitingPromotion, now);
                Action::Hold
            }
            _ => {
                self.enter_step(index + 1, now);
                Action::SetTraffic { step: index + 1 }
            }
        }
    }

    /// PROMOTING → COMPLETED.
    pub fn complete(&mut self, now: u64) -> Action {
        if self.release.status != ReleaseStatus::Promoting {
            return Action::Hold;
        }
        self.release.status = ReleaseStatus::Completed;
        self.touch(now);
        info!(release = %self.release.id, "release completed");
        Action::Done
    }

    /// Advance a paused release to its next step, or finish it when paused
    /// at the last one.
    pub fn promote(&mut self, now: u64) -> RolloutResult<Action> {
        self.require("promote", &[ReleaseStatus::Paused])?;
        self.hold = None;
        let index = self.step_index();
        if self.plan.is_last(index) {
            return Ok(self.enter_promoting(now));
        }
        self.release.status = ReleaseStatus::Running;
        self.enter_step(index + 1, now);
        info!(release = %self.release.id, stage = %self.stage_name(), "release promoted");
        Ok(Action::SetTraffic { step: index + 1 })
    }

    pub fn pause(&mut self, now: u64) -> RolloutResult<Action> {
        self.require("pause", &[ReleaseStatus::Running])?;
        self.enter_hold(HoldReason::Operator, now);
        info!(release = %self.release.id, stage = %self.stage_name(), "release paused");
        Ok(Action::Hold)
    }

    /// PAUSED → RUNNING at the same step.
    pub fn resume(&mut self, now: u64) -> RolloutResult<Action> {
        self.require("resume", &[ReleaseStatus::Paused])?;
        self.hold = None;
        self.release.status = ReleaseStatus::Running;
        self.touch(now);
        info!(release = %self.release.id, stage = %self.stage_name(), "release resumed");
        Ok(self.step_action())
    }

    /// Health recovered while held. Resumes a DEGRADED hold when
    /// auto-resume is enabled.
    pub fn recovered(&mut self, now: u64) -> Option<Action> {
        let degraded = matches!(self.hold, Some(HoldReason::Degraded { .. }));
        if !degraded || !self.plan.auto_resume_on_recovery {
            return None;
        }
        info!(release = %self.release.id, "health recovered, resuming");
        self.resume(now).ok()
    }

    /// When the current DEGRADED hold times out, if ever.
    pub fn degraded_deadline(&self) -> Option<u64> {
        match (&self.hold, self.plan.degraded_timeout) {
            (Some(HoldReason::Degraded { since }), Some(timeout)) => {
                Some(since + timeout.as_millis() as u64)
            }
            _ => None,
        }
    }

    /// Roll back if the DEGRADED hold has outlasted its timeout.
    pub fn degraded_expired(&mut self, now: u64) -> Option<Action> {
        let deadline = self.degraded_deadline()?;
        if now < deadline || self.release.status != ReleaseStatus::Paused {
            return None;
        }
        Some(self.enter_rollback(format!("degraded hold at {} timed out", self.stage_name()), now))
    }

    /// Any non-terminal state → ROLLING_BACK.
    pub fn begin_rollback(&mut self, reason: &str, now: u64) -> RolloutResult<Action> {
        if self.release.is_terminal() || self.release.status == ReleaseStatus::RollingBack {
            return Err(self.invalid("rollback"));
        }
        Ok(self.enter_rollback(reason.to_string(), now))
    }

    /// The router confirmed all traffic is back on stable.
    pub fn rollback_confirmed(&mut self, now: u64) -> Action {
        self.release.status = ReleaseStatus::RolledBack;
        self.release.traffic = TrafficSplit::all_stable();
        self.touch(now);
        info!(release = %self.release.id, reason = ?self.release.reason, "release rolled back");
        Action::Done
    }

    /// The rollback was not confirmed in time.
    pub fn escalate(&mut self, now: u64) -> Action {
        self.release.status = ReleaseStatus::Escalated;
        self.touch(now);
        Action::AwaitOperator
    }

    /// Abandon a release that never shifted any traffic.
    pub fn fail(&mut self, reason: &str, now: u64) -> Action {
        self.release.status = ReleaseStatus::Failed;
        self.release.reason = Some(reason.to_string());
        self.hold = None;
        self.touch(now);
        warn!(release = %self.release.id, %reason, "release failed");
        Action::Done
    }

    /// The action that continues a release loaded from storage.
    pub fn recover(&mut self, now: u64) -> RolloutResult<Action> {
        Ok(match self.release.status {
            ReleaseStatus::Pending => return self.start(now),
            ReleaseStatus::Running => self.step_action(),
            ReleaseStatus::Paused => {
                self.hold.get_or_insert(HoldReason::Operator);
                Action::Hold
            }
            ReleaseStatus::Promoting => Action::Finalize,
            ReleaseStatus::RollingBack => Action::Rollback {
                reason: self.release.reason.clone().unwrap_or_default(),
            },
            ReleaseStatus::Escalated => Action::AwaitOperator,
            _ => Action::Done,
        })
    }

    pub fn stage_name(&self) -> String {
        self.current_step()
            .map(|s| s.stage.clone())
            .unwrap_or_else(|| "none".to_string())
    }

    /// Re-observe the current step, re-sending traffic first if it was
    /// never applied.
    fn step_action(&self) -> Action {
        let index = self.step_index();
        match self.plan.step(index) {
            Some(step) if self.release.traffic == step.split => Action::Observe {
                step: index,
                window: step.observation,
            },
            Some(_) => Action::SetTraffic { step: index },
            None => Action::Hold,
        }
    }

    fn enter_step(&mut self, index: usize, now: u64) {
        self.release.step = index as u32;
        self.release.current_stage = self.plan.step(index).map(|s| s.stage.clone());
        self.touch(now);
    }

    fn enter_hold(&mut self, reason: HoldReason, now: u64) {
        self.release.status = ReleaseStatus::Paused;
        self.hold = Some(reason);
        self.touch(now);
    }

    fn enter_promoting(&mut self, now: u64) -> Action {
        self.release.status = ReleaseStatus::Promoting;
        self.hold = None;
        self.touch(now);
        info!(release = %self.release.id, "all steps healthy, promoting");
        Action::Finalize
    }

    fn enter_rollback(&mut self, reason: String, now: u64) -> Action {
        warn!(release = %self.release.id, %reason, "rolling back release");
        self.release.status = ReleaseStatus::RollingBack;
        self.release.reason = Some(reason.clone());
        self.hold = None;
        self.touch(now);
        Action::Rollback { reason }
    }

    fn require(&self, command: &str, allowed: &[ReleaseStatus]) -> RolloutResult<()> {
        if allowed.contains(&self.release.status) {
            Ok(())
        } else {
            Err(self.invalid(command))
        }
    }

    fn invalid(&self, command: &str) -> RolloutError {
        RolloutError::InvalidTransition {
            release_id: self.release.id.clone(),
            command: command.to_string(),
            status: self.release.status,
        }
    }

    fn touch(&mut self, now: u64) {
        self.release.updated_at = now;
    }
}
