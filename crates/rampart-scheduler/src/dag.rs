//! Stage DAGs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{SchedulerError, SchedulerResult, StageError};

pub type StageFuture =
    Pin<Box<dyn Future<Output = Result<serde_json::Value, StageError>> + Send>>;

/// A stage body. Invoked once per attempt.
pub type StageOp = Arc<dyn Fn() -> StageFuture + Send + Sync>;

/// Wrap an async closure as a [`StageOp`].
pub fn stage_op<F, Fut>(f: F) -> StageOp
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, StageError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub depends_on: Vec<String>,
    pub op: StageOp,
}

#[derive(Clone, Default)]
pub struct Dag {
    stages: Vec<StageSpec>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, name: &str, depends_on: &[&str], op: StageOp) -> Self {
        self.stages.push(StageSpec {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            op,
        });
        self
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn get(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Check names and edges, returning stage names in a topological order.
    pub fn validate(&self) -> SchedulerResult<Vec<String>> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(SchedulerError::DuplicateStage(stage.name.clone()));
            }
        }
        for stage in &self.stages {
            if let Some(dep) = stage.depends_on.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(SchedulerError::UnknownDependency {
                    stage: stage.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        // Kahn's algorithm, preserving declaration order among ready stages.
        let mut indegree: HashMap<&str, usize> = self
            .stages
            .iter()
            .map(|s| (s.name.as_str(), s.depends_on.len()))
            .collect();
        let mut queue: VecDeque<&str> = self
            .stages
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.name.as_str())
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            for dependent in self.stages.iter().filter(|s| s.depends_on.iter().any(|d| d == name)) {
                if let Some(n) = indegree.get_mut(dependent.name.as_str()) {
                    *n -= 1;
                    if *n == 0 {
                        queue.push_back(dependent.name.as_str());
                    }
                }
            }
        }

        if order.len() != self.stages.len() {
            let stuck: Vec<&str> = self
                .stages
                .iter()
                .map(|s| s.name.as_str())
                .filter(|n| !order.iter().any(|o| o == n))
                .collect();
            return Err(SchedulerError::Cycle(stuck.join(", ")));
        }
        Ok(order)
    }
}
