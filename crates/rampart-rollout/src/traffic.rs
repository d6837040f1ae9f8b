//! Traffic router seam.
//!
//! The router is write-only from the controller's point of view: the
//! controller tracks the split it intends and sends absolute targets, so a
//! repeated call is always safe.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rampart_scheduler::StageError;
use rampart_state::{TrafficSplit, env_key};
use tracing::info;

#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Route traffic for a project environment according to `split`
    /// (`{segment: percent}`, summing to 100).
    async fn set_split(
        &self,
        project: &str,
        environment: &str,
        split: &BTreeMap<String, u8>,
    ) -> Result<(), StageError>;
}

/// Router that records splits in memory. Backs the standalone daemon.
#[derive(Clone, Default)]
pub struct InMemoryRouter {
    splits: Arc<RwLock<HashMap<String, BTreeMap<String, u8>>>>,
}

impl InMemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last split applied to a project environment.
    pub fn current(&self, project: &str, environment: &str) -> Option<TrafficSplit> {
        let splits = self.splits.read().ok()?;
        let map = splits.get(&env_key(project, environment))?;
        Some(TrafficSplit {
            stable: map.get("stable").copied().unwrap_or(0),
            candidate: map.get("candidate").copied().unwrap_or(0),
        })
    }
}

#[async_trait]
impl TrafficRouter for InMemoryRouter {
    async fn set_split(
        &self,
        project: &str,
        environment: &str,
        split: &BTreeMap<String, u8>,
    ) -> Result<(), StageError> {
        let total: u16 = split.values().map(|&p| p as u16).sum();
        if total != 100 {
            return Err(StageError::permanent(format!("split sums to {total}, expected 100")));
        }
        let mut splits = self
            .splits
            .write()
            .map_err(|e| StageError::transient(e.to_string()))?;
        splits.insert(env_key(project, environment), split.clone());
        info!(%project, %environment, ?split, "traffic split applied");
        Ok(())
    }
}
