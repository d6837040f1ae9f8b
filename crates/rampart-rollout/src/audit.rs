//! Audit recorder — append-only trail of every release transition.
//!
//! Writes are retried with backoff until they succeed. A transition is not
//! committed before its entry is durable, so a stalled store stalls the
//! release rather than losing history.

use std::sync::Arc;

use rampart_core::Clock;
use rampart_scheduler::{RetryPolicy, StageError, with_retry};
use rampart_state::{AuditEntry, Release, ReleaseStore};
use tracing::{debug, error};

use crate::error::{RolloutError, RolloutResult};

pub const SYSTEM_ACTOR: &str = "system";
pub const HEALTH_ACTOR: &str = "health-monitor";

/// Fields of an entry before the store assigns its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub actor: String,
    pub action: String,
    pub stage: Option<String>,
    pub reason: String,
    pub diff_ref: Option<String>,
}

impl AuditEvent {
    pub fn new(actor: &str, action: &str, reason: impl Into<String>) -> Self {
        Self {
            actor: actor.to_string(),
            action: action.to_string(),
            stage: None,
            reason: reason.into(),
            diff_ref: None,
        }
    }

    pub fn stage(mut self, stage: Option<String>) -> Self {
        self.stage = stage;
        self
    }

    pub fn diff(mut self, diff: impl Into<String>) -> Self {
        self.diff_ref = Some(diff.into());
        self
    }
}

#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn ReleaseStore>,
    retry: RetryPolicy,
    clock: Clock,
}

impl AuditRecorder {
    /// `retry` supplies the backoff curve; its attempt ceiling is ignored.
    pub fn new(store: Arc<dyn ReleaseStore>, retry: &RetryPolicy, clock: Clock) -> Self {
        Self {
            store,
            retry: retry.unbounded(),
            clock,
        }
    }

    /// Append an entry for `release_id`, retrying until the store accepts
    /// it. Returns the assigned sequence number.
    pub async fn record(&self, release_id: &str, event: AuditEvent) -> RolloutResult<u64> {
        let entry = AuditEntry {
            seq: 0,
            actor: event.actor,
            action: event.action,
            release_id: release_id.to_string(),
            stage: event.stage,
            reason: event.reason,
            diff_ref: event.diff_ref,
            timestamp: self.clock.now_ms(),
        };
        let store = self.store.clone();
        let seq = with_retry(&self.retry, "audit.append", |_| {
            let store = store.clone();
            let entry = entry.clone();
            async move {
                store
                    .append_audit_entry(&entry)
                    .map_err(|e| StageError::transient(e.to_string()))
            }
        })
        .await
        .map_err(|e| {
            error!(release = %release_id, error = %e, "audit write abandoned");
            RolloutError::AuditWriteFailure(e.to_string())
        })?;
        debug!(release = %release_id, seq, action = %entry.action, "audit recorded");
        Ok(seq)
    }

    /// Persist a release record with the same retry discipline.
    pub async fn save_release(&self, release: &Release) -> RolloutResult<()> {
        let store = self.store.clone();
        with_retry(&self.retry, "release.save", |_| {
            let store = store.clone();
            let release = release.clone();
            async move {
                store
                    .save_release(&release)
                    .map_err(|e| StageError::transient(e.to_string()))
            }
        })
        .await
        .map_err(|e| RolloutError::AuditWriteFailure(e.to_string()))
    }

    pub fn trail(&self, release_id: &str) -> RolloutResult<Vec<AuditEntry>> {
        Ok(self.store.audit_trail(release_id)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rampart_state::StateStore;

    use super::*;
    use crate::testing::FlakyStore;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: Some(2),
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_past_the_attempt_ceiling() {
        let store = Arc::new(FlakyStore::new(StateStore::open_in_memory().unwrap()));
        store.fail_next_audit_writes(6);
        let recorder = AuditRecorder::new(store.clone(), &policy(), Clock::anchored_at(0));

        let seq = recorder
            .record("rel-1", AuditEvent::new(SYSTEM_ACTOR, "release.created", "created"))
            .await
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(store.failed_audit_writes(), 6);

        let trail = recorder.trail("rel-1").unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, "release.created");
        assert_eq!(trail[0].actor, SYSTEM_ACTOR);
    }

    #[tokio::test]
    async fn event_builder_carries_stage_and_diff() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let recorder = AuditRecorder::new(store, &policy(), Clock::anchored_at(0));
        recorder
            .record(
                "rel-1",
                AuditEvent::new("alice", "release.transition", "operator pause")
                    .stage(Some("canary_5pct".to_string()))
                    .diff("running -> paused"),
            )
            .await
            .unwrap();
        let entry = &recorder.trail("rel-1").unwrap()[0];
        assert_eq!(entry.stage.as_deref(), Some("canary_5pct"));
        assert_eq!(entry.diff_ref.as_deref(), Some("running -> paused"));
    }
}
