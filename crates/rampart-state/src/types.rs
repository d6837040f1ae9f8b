//! Domain types for the release store.
//!
//! These types represent the persisted state of releases, the audit
//! trail, scheduler stage attempts, postmortem stubs, and policy waivers.
//! All types are serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a release.
pub type ReleaseId = String;

/// Build the `{project}/{environment}` key that scopes the active release.
pub fn env_key(project: &str, environment: &str) -> String {
    format!("{project}/{environment}")
}

// ── Release ────────────────────────────────────────────────────────

/// How a release shifts traffic onto the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    BlueGreen,
    Canary,
    Rolling,
    Direct,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::BlueGreen => "blue-green",
            Strategy::Canary => "canary",
            Strategy::Rolling => "rolling",
            Strategy::Direct => "direct",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blue-green" | "blue_green" | "bluegreen" => Ok(Strategy::BlueGreen),
            "canary" => Ok(Strategy::Canary),
            "rolling" => Ok(Strategy::Rolling),
            "direct" => Ok(Strategy::Direct),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// Lifecycle status of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    Running,
    Paused,
    Promoting,
    RollingBack,
    /// Rollback did not confirm in time; waiting on an operator.
    Escalated,
    Completed,
    RolledBack,
    Failed,
}

impl ReleaseStatus {
    /// Completed, rolled back, and failed releases never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::Completed | ReleaseStatus::RolledBack | ReleaseStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Running => "running",
            ReleaseStatus::Paused => "paused",
            ReleaseStatus::Promoting => "promoting",
            ReleaseStatus::RollingBack => "rolling_back",
            ReleaseStatus::Escalated => "escalated",
            ReleaseStatus::Completed => "completed",
            ReleaseStatus::RolledBack => "rolled_back",
            ReleaseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A traffic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    /// The last-known-good release.
    Stable,
    /// The release being rolled out.
    Candidate,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Stable => "stable",
            Segment::Candidate => "candidate",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable/candidate traffic percentages. Always sums to 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub stable: u8,
    pub candidate: u8,
}

impl TrafficSplit {
    /// All traffic on the last-known-good release.
    pub fn all_stable() -> Self {
        Self {
            stable: 100,
            candidate: 0,
        }
    }

    /// Route `percent` to the candidate and the remainder to stable.
    /// Values above 100 are clamped.
    pub fn candidate(percent: u8) -> Self {
        let candidate = percent.min(100);
        Self {
            stable: 100 - candidate,
            candidate,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.stable as u16 + self.candidate as u16 == 100
    }

    /// Segment → percent map, the shape the traffic router consumes.
    pub fn to_map(&self) -> BTreeMap<String, u8> {
        BTreeMap::from([
            (Segment::Stable.to_string(), self.stable),
            (Segment::Candidate.to_string(), self.candidate),
        ])
    }
}

impl Default for TrafficSplit {
    fn default() -> Self {
        Self::all_stable()
    }
}

impl fmt::Display for TrafficSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stable={} candidate={}", self.stable, self.candidate)
    }
}

/// One deployment attempt of an artifact into a project environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Release {
    pub id: ReleaseId,
    pub project: String,
    pub environment: String,
    /// Artifact reference, e.g. a commit SHA or image digest.
    pub artifact: String,
    pub strategy: Strategy,
    pub status: ReleaseStatus,
    /// Risk score in 0.0–10.0.
    pub risk_score: f64,
    /// The split the controller last committed.
    pub traffic: TrafficSplit,
    /// Name of the stage currently executing or last executed.
    pub current_stage: Option<String>,
    /// Index into the strategy's step/group list.
    pub step: u32,
    pub auto_promote: bool,
    /// Artifact that traffic reverts to on rollback.
    pub last_known_good: Option<String>,
    /// Why the release ended up where it is (rollback or failure reason).
    pub reason: Option<String>,
    /// Unix timestamp (millis) when the release was created.
    pub created_at: u64,
    /// Unix timestamp (millis) of the last status change.
    pub updated_at: u64,
}

impl Release {
    pub fn env_key(&self) -> String {
        env_key(&self.project, &self.environment)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ── Stages ────────────────────────────────────────────────────────

/// Execution status of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Done,
    Error,
}

/// One attempt at one pipeline stage, keyed by its idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRecord {
    /// Release id or run id the stage belongs to.
    pub scope: String,
    pub stage: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub status: StageStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: u64,
    pub finished_at: Option<u64>,
}

impl StageRecord {
    /// Build the idempotency key `(scope, stage, attempt)` as a table key.
    pub fn table_key(&self) -> String {
        stage_key(&self.scope, &self.stage, self.attempt)
    }
}

/// Table key for a stage attempt.
pub fn stage_key(scope: &str, stage: &str, attempt: u32) -> String {
    format!("{scope}:{stage}:{attempt:04}")
}

// ── Audit ─────────────────────────────────────────────────────────

/// Immutable record of one release or stage transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Assigned by the store on append; zero before that.
    pub seq: u64,
    /// "system", "health-monitor", or the operator that issued a command.
    pub actor: String,
    /// Dotted action name, e.g. `release.transition`, `rollback.breach`.
    pub action: String,
    pub release_id: ReleaseId,
    pub stage: Option<String>,
    pub reason: String,
    /// Short description of what changed, e.g. `running -> rolling_back`.
    pub diff_ref: Option<String>,
    pub timestamp: u64,
}

// ── Postmortem ────────────────────────────────────────────────────

/// Skeleton incident record emitted after every rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostmortemStub {
    pub id: String,
    pub release_id: ReleaseId,
    pub reason: String,
    /// One line per linked audit entry.
    pub timeline: Vec<String>,
    pub root_cause: String,
    pub audit_refs: Vec<u64>,
    /// Instance groups the rollback reverted (rolling releases only).
    #[serde(default)]
    pub reverted_groups: Vec<u32>,
    pub created_at: u64,
}

// ── Waivers ───────────────────────────────────────────────────────

/// A time-bounded override for a failing, waivable policy check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaiverRecord {
    pub project: String,
    pub check_name: String,
    pub reason: String,
    pub waived_by: String,
    /// Unix timestamp (millis) after which the waiver no longer applies.
    pub expires_at: u64,
    pub created_at: u64,
}

impl WaiverRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.project, self.check_name)
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traffic_split_always_sums_to_100() {
        for pct in [0u8, 1, 5, 25, 100, 250] {
            let split = TrafficSplit::candidate(pct);
            assert!(split.is_valid(), "{split}");
        }
        assert_eq!(TrafficSplit::candidate(250).candidate, 100);
    }

    #[test]
    fn traffic_split_map_names_segments() {
        let map = TrafficSplit::candidate(5).to_map();
        assert_eq!(map["stable"], 95);
        assert_eq!(map["candidate"], 5);
    }

    #[test]
    fn terminal_statuses() {
        assert!(ReleaseStatus::Completed.is_terminal());
        assert!(ReleaseStatus::RolledBack.is_terminal());
        assert!(ReleaseStatus::Failed.is_terminal());
        assert!(!ReleaseStatus::Escalated.is_terminal());
        assert!(!ReleaseStatus::Paused.is_terminal());
    }

    #[test]
    fn strategy_parses_and_serializes_kebab_case() {
        assert_eq!("blue-green".parse::<Strategy>().unwrap(), Strategy::BlueGreen);
        assert!("yolo".parse::<Strategy>().is_err());
        let json = serde_json::to_string(&Strategy::BlueGreen).unwrap();
        assert_eq!(json, "\"blue-green\"");
    }

    #[test]
    fn stage_key_pads_attempt() {
        assert_eq!(stage_key("rel-1", "rollout.ramp_5pct", 3), "rel-1:rollout.ramp_5pct:0003");
    }

    #[test]
    fn waiver_expiry_is_exclusive() {
        let waiver = WaiverRecord {
            project: "shop".to_string(),
            check_name: "test_coverage".to_string(),
            reason: "legacy module".to_string(),
            waived_by: "ops".to_string(),
            expires_at: 2_000,
            created_at: 1_000,
        };
        assert!(waiver.is_active(1_999));
        assert!(!waiver.is_active(2_000));
    }
}
