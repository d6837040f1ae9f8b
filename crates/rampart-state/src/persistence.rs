//! Persistence seam used by the rollout controller and audit recorder.
//!
//! `StateStore` implements it directly. Tests wrap a store to inject
//! failures into individual operations.

use crate::error::StateResult;
use crate::types::{AuditEntry, PostmortemStub, Release};

pub trait ReleaseStore: Send + Sync {
    /// Append an entry and return the sequence number the store assigned.
    fn append_audit_entry(&self, entry: &AuditEntry) -> StateResult<u64>;

    fn save_release(&self, release: &Release) -> StateResult<()>;

    fn load_release(&self, id: &str) -> StateResult<Option<Release>>;

    /// The non-terminal release for `{project}/{environment}`, if any.
    fn load_active_release(&self, project: &str, environment: &str) -> StateResult<Option<Release>>;

    fn audit_trail(&self, release_id: &str) -> StateResult<Vec<AuditEntry>>;

    fn save_postmortem(&self, stub: &PostmortemStub) -> StateResult<()>;

    fn load_postmortem(&self, release_id: &str) -> StateResult<Option<PostmortemStub>>;

    fn list_releases(&self) -> StateResult<Vec<Release>>;
}
