//! Release progress events broadcast to subscribers.

use rampart_state::{Release, ReleaseStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub release_id: String,
    pub stage: Option<String>,
    /// Candidate traffic percent.
    pub percent: u8,
    pub status: ReleaseStatus,
    pub message: String,
    pub at: u64,
}

impl ProgressEvent {
    pub fn for_release(release: &Release, message: impl Into<String>) -> Self {
        Self {
            release_id: release.id.clone(),
            stage: release.current_stage.clone(),
            percent: release.traffic.candidate,
            status: release.status,
            message: message.into(),
            at: release.updated_at,
        }
    }
}

pub fn channel() -> broadcast::Sender<ProgressEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}
