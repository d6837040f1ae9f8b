//! Exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rampart_core::{ConfigResult, SchedulerSection, field_duration};
use rand::Rng;
use tracing::warn;

use crate::error::StageError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempt ceiling. `None` retries transient errors forever.
    pub max_attempts: Option<u32>,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(section: &SchedulerSection) -> ConfigResult<Self> {
        Ok(Self {
            max_attempts: Some(section.max_attempts),
            base_backoff: field_duration("scheduler.base_backoff", &section.base_backoff)?,
            max_backoff: field_duration("scheduler.max_backoff", &section.max_backoff)?,
            jitter: section.jitter,
        })
    }

    /// Same backoff curve with no attempt ceiling.
    pub fn unbounded(&self) -> Self {
        Self {
            max_attempts: None,
            ..self.clone()
        }
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    ///
    /// `base × 2^(attempt-1)` capped at `max_backoff`. With jitter the delay
    /// is drawn uniformly from the upper half of that value.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        let extra = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(extra)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy gives up.
///
/// Does not touch the stage cache; for writes that must not depend on the
/// store they retry against.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, StageError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && policy.allows(attempt + 1) => {
                let delay = policy.delay_for(attempt);
                warn!(%label, attempt, error = %e, ?delay, "retrying after transient error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
