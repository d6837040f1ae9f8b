//! Notification sink.

use std::sync::Arc;

use async_trait::async_trait;
use rampart_state::Release;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: AlertLevel,
    pub release_id: String,
    pub project: String,
    pub environment: String,
    pub title: String,
    pub message: String,
    pub at: u64,
}

impl Notification {
    pub fn about(release: &Release, level: AlertLevel, title: &str, message: impl Into<String>, at: u64) -> Self {
        Self {
            level,
            release_id: release.id.clone(),
            project: release.project.clone(),
            environment: release.environment.clone(),
            title: title.to_string(),
            message: message.into(),
            at,
        }
    }
}

/// Deliver on a background task so a slow sink never holds up a release.
pub fn dispatch(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = notifier.clone();
    tokio::spawn(async move { notifier.notify(notification).await });
}

/// Fire-and-forget delivery. Implementations swallow their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: Notification) {
        match n.level {
            AlertLevel::Info => {
                info!(release = %n.release_id, project = %n.project, env = %n.environment, title = %n.title, "{}", n.message)
            }
            AlertLevel::Warning => {
                warn!(release = %n.release_id, project = %n.project, env = %n.environment, title = %n.title, "{}", n.message)
            }
            AlertLevel::Critical => {
                error!(release = %n.release_id, project = %n.project, env = %n.environment, title = %n.title, "{}", n.message)
            }
        }
    }
}
