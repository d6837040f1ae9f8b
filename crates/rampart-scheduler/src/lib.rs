//! rampart-scheduler — stage execution for release pipelines.
//!
//! Runs a DAG of named stages with dependency edges. Each attempt is
//! persisted under `(scope, stage, attempt)`, so a stage that already
//! finished in a scope returns its recorded result instead of running
//! again. Transient failures retry with exponential backoff and jitter;
//! permanent failures halt dependent stages.
//!
//! ```text
//! PipelineScheduler
//!   ├── StateStore (stage attempt records)
//!   ├── RetryPolicy (attempt ceiling, backoff curve)
//!   └── Dag
//!       └── StageSpec { name, depends_on, op }
//! ```

pub mod dag;
pub mod error;
pub mod retry;
pub mod scheduler;

pub use dag::{Dag, StageFuture, StageOp, StageSpec, stage_op};
pub use error::{SchedulerError, SchedulerResult, StageError};
pub use retry::{RetryPolicy, with_retry};
pub use scheduler::{PipelineScheduler, RunResult, StageOutcome};
