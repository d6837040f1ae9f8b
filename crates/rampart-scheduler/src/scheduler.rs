//! PipelineScheduler — runs stage DAGs with durable, idempotent attempts.
//!
//! Every attempt is recorded in the store under `(scope, stage, attempt)`.
//! A stage whose earlier attempt in the same scope finished DONE is not
//! executed again; its recorded result is returned instead.

use std::collections::HashMap;
use std::sync::Arc;

use rampart_core::Clock;
use rampart_state::{StageRecord, StageStatus, StateStore};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::dag::{Dag, StageOp};
use crate::error::{SchedulerError, SchedulerResult, StageError};
use crate::retry::RetryPolicy;

/// Final state of one stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Done {
        value: serde_json::Value,
        attempt: u32,
        /// Returned from an earlier DONE attempt without executing.
        cached: bool,
    },
    Failed {
        error: StageError,
        attempts: u32,
    },
    /// Not executed because a predecessor did not finish DONE.
    Skipped { blocked_by: String },
}

impl StageOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, StageOutcome::Done { .. })
    }

    pub fn into_result(self) -> Result<serde_json::Value, StageError> {
        match self {
            StageOutcome::Done { value, .. } => Ok(value),
            StageOutcome::Failed { error, .. } => Err(error),
            StageOutcome::Skipped { blocked_by } => {
                Err(StageError::permanent(format!("skipped, blocked by {blocked_by}")))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub scope: String,
    /// Outcomes in topological order.
    pub stages: Vec<(String, StageOutcome)>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|(_, o)| o.is_done())
    }

    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|(n, _)| n == stage).map(|(_, o)| o)
    }
}

#[derive(Clone)]
pub struct PipelineScheduler {
    store: StateStore,
    policy: RetryPolicy,
    clock: Clock,
    /// (scope, stage) → op of the latest run, for `retry`.
    ops: Arc<RwLock<HashMap<(String, String), StageOp>>>,
}

impl PipelineScheduler {
    pub fn new(store: StateStore, policy: RetryPolicy, clock: Clock) -> Self {
        Self {
            store,
            policy,
            clock,
            ops: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute a DAG. Independent stages run concurrently; a stage starts
    /// once all its predecessors are DONE and is skipped if any is not.
    pub async fn run(&self, dag: &Dag, scope: &str) -> SchedulerResult<RunResult> {
        let order = dag.validate()?;
        {
            let mut ops = self.ops.write().await;
            for stage in dag.stages() {
                ops.insert((scope.to_string(), stage.name.clone()), stage.op.clone());
            }
        }
        info!(%scope, stages = dag.len(), "pipeline run starting");

        let mut outcomes: HashMap<String, StageOutcome> = HashMap::new();
        let mut started: Vec<String> = Vec::new();
        let mut running = JoinSet::new();

        loop {
            for name in &order {
                if outcomes.contains_key(name) || started.contains(name) {
                    continue;
                }
                let Some(spec) = dag.get(name) else { continue };

                let blocked = spec.depends_on.iter().find(|d| {
                    outcomes.get(d.as_str()).is_some_and(|o| !o.is_done())
                });
                if let Some(blocker) = blocked {
                    debug!(%scope, stage = %name, blocked_by = %blocker, "stage skipped");
                    outcomes.insert(
                        name.clone(),
                        StageOutcome::Skipped {
                            blocked_by: blocker.clone(),
                        },
                    );
                    continue;
                }
                let ready = spec.depends_on.iter().all(|d| outcomes.contains_key(d.as_str()));
                if ready {
                    started.push(name.clone());
                    let this = self.clone();
                    let scope = scope.to_string();
                    let name = name.clone();
                    let op = spec.op.clone();
                    running.spawn(async move {
                        let outcome = this.execute(&scope, &name, op, &this.policy).await;
                        (name, outcome)
                    });
                }
            }

            // Skips can cascade without any task finishing.
            if outcomes.len() == order.len() {
                break;
            }
            match running.join_next().await {
                Some(Ok((name, outcome))) => {
                    outcomes.insert(name, outcome?);
                }
                Some(Err(join_err)) => {
                    warn!(%scope, error = %join_err, "stage task panicked");
                    return Err(SchedulerError::Task(join_err.to_string()));
                }
                // Nothing running; remaining stages resolve on the next pass.
                None => continue,
            }
        }

        let stages: Vec<(String, StageOutcome)> = order
            .into_iter()
            .filter_map(|n| outcomes.remove(&n).map(|o| (n, o)))
            .collect();
        let result = RunResult {
            scope: scope.to_string(),
            stages,
        };
        info!(%scope, succeeded = result.succeeded(), "pipeline run finished");
        Ok(result)
    }

    /// Re-run one stage of an earlier run in `scope`.
    pub async fn retry(&self, scope: &str, stage: &str) -> SchedulerResult<StageOutcome> {
        let op = self
            .ops
            .read()
            .await
            .get(&(scope.to_string(), stage.to_string()))
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownStage {
                scope: scope.to_string(),
                stage: stage.to_string(),
            })?;
        self.execute(scope, stage, op, &self.policy).await
    }

    /// Run a single stage outside of any DAG.
    pub async fn run_stage(&self, scope: &str, stage: &str, op: StageOp) -> SchedulerResult<StageOutcome> {
        self.execute(scope, stage, op, &self.policy).await
    }

    /// Run a single stage with a caller-supplied retry policy.
    pub async fn run_stage_with(
        &self,
        scope: &str,
        stage: &str,
        op: StageOp,
        policy: &RetryPolicy,
    ) -> SchedulerResult<StageOutcome> {
        self.execute(scope, stage, op, policy).await
    }

    async fn execute(
        &self,
        scope: &str,
        stage: &str,
        op: StageOp,
        policy: &RetryPolicy,
    ) -> SchedulerResult<StageOutcome> {
        let prior = self.store.list_stage_attempts(scope, stage)?;
        if let Some(done) = prior.iter().find(|r| r.status == StageStatus::Done) {
            debug!(%scope, %stage, attempt = done.attempt, "stage already done, returning cached result");
            return Ok(StageOutcome::Done {
                value: done.result.clone().unwrap_or(serde_json::Value::Null),
                attempt: done.attempt,
                cached: true,
            });
        }

        let first_attempt = prior.last().map_or(1, |r| r.attempt + 1);
        let mut tries = 1u32;
        loop {
            let attempt = first_attempt + tries - 1;
            let mut record = StageRecord {
                scope: scope.to_string(),
                stage: stage.to_string(),
                attempt,
                status: StageStatus::Running,
                result: None,
                error: None,
                started_at: self.clock.now_ms(),
                finished_at: None,
            };
            self.store.put_stage(&record)?;
            debug!(%scope, %stage, attempt, "stage attempt started");

            let result = op().await;
            record.finished_at = Some(self.clock.now_ms());
            match result {
                Ok(value) => {
                    record.status = StageStatus::Done;
                    record.result = Some(value.clone());
                    self.store.put_stage(&record)?;
                    debug!(%scope, %stage, attempt, "stage done");
                    return Ok(StageOutcome::Done {
                        value,
                        attempt,
                        cached: false,
                    });
                }
                Err(error) => {
                    record.status = StageStatus::Error;
                    record.error = Some(error.to_string());
                    self.store.put_stage(&record)?;

                    if error.is_transient() && policy.allows(tries + 1) {
                        let delay = policy.delay_for(tries);
                        warn!(%scope, %stage, attempt, error = %error, ?delay, "stage failed, retrying");
                        tokio::time::sleep(delay).await;
                        tries += 1;
                        continue;
                    }
                    warn!(%scope, %stage, attempt, error = %error, "stage failed");
                    return Ok(StageOutcome::Failed {
                        error,
                        attempts: tries,
                    });
                }
            }
        }
    }
}
