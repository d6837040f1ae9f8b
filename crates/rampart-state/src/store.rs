//! StateStore — redb-backed persistence for releases and their audit trail.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::persistence::ReleaseStore;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe release store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "release store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory release store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RELEASES).map_err(map_err!(Table))?;
        txn.open_table(ACTIVE_RELEASES).map_err(map_err!(Table))?;
        txn.open_table(AUDIT).map_err(map_err!(Table))?;
        txn.open_table(STAGES).map_err(map_err!(Table))?;
        txn.open_table(POSTMORTEMS).map_err(map_err!(Table))?;
        txn.open_table(WAIVERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Releases ───────────────────────────────────────────────────

    /// Insert or update a release.
    ///
    /// The active-release index is maintained in the same transaction: a
    /// non-terminal release claims its `{project}/{environment}` slot and a
    /// terminal one releases it.
    pub fn put_release(&self, release: &Release) -> StateResult<()> {
        let value = serde_json::to_vec(release).map_err(map_err!(Serialize))?;
        let env = release.env_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            table
                .insert(release.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut active = txn.open_table(ACTIVE_RELEASES).map_err(map_err!(Table))?;
            if release.is_terminal() {
                let holds_slot = active
                    .get(env.as_str())
                    .map_err(map_err!(Read))?
                    .is_some_and(|guard| guard.value() == release.id);
                if holds_slot {
                    active.remove(env.as_str()).map_err(map_err!(Write))?;
                }
            } else {
                active
                    .insert(env.as_str(), release.id.as_str())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(release = %release.id, status = %release.status, "release stored");
        Ok(())
    }

    /// Get a release by id.
    pub fn get_release(&self, id: &str) -> StateResult<Option<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let release: Release =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(release))
            }
            None => Ok(None),
        }
    }

    /// List all releases.
    pub fn list_releases(&self) -> StateResult<Vec<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let release: Release =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(release);
        }
        Ok(results)
    }

    /// Get the non-terminal release for a project environment, if any.
    pub fn get_active_release(&self, project: &str, environment: &str) -> StateResult<Option<Release>> {
        let key = env_key(project, environment);
        let id = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(ACTIVE_RELEASES).map_err(map_err!(Table))?;
            match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => guard.value().to_string(),
                None => return Ok(None),
            }
        };
        self.get_release(&id)
    }

    // ── Audit ──────────────────────────────────────────────────────

    /// Append an audit entry and return its assigned sequence number.
    pub fn append_audit(&self, entry: &AuditEntry) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
            seq = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value() + 1)
                .unwrap_or(1);
            let mut stored = entry.clone();
            stored.seq = seq;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table.insert(seq, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(seq, release = %entry.release_id, action = %entry.action, "audit entry appended");
        Ok(seq)
    }

    /// All audit entries for a release, in append order.
    pub fn list_audit_for_release(&self, release_id: &str) -> StateResult<Vec<AuditEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let audit: AuditEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if audit.release_id == release_id {
                results.push(audit);
            }
        }
        Ok(results)
    }

    // ── Stages ─────────────────────────────────────────────────────

    /// Insert or update a stage attempt.
    pub fn put_stage(&self, record: &StageRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STAGES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get one stage attempt by its idempotency key.
    pub fn get_stage(&self, scope: &str, stage: &str, attempt: u32) -> StateResult<Option<StageRecord>> {
        let key = stage_key(scope, stage, attempt);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STAGES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: StageRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// All attempts of a stage within a scope, oldest first.
    pub fn list_stage_attempts(&self, scope: &str, stage: &str) -> StateResult<Vec<StageRecord>> {
        let prefix = format!("{scope}:{stage}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STAGES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: StageRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        results.sort_by_key(|r| r.attempt);
        Ok(results)
    }

    // ── Postmortems ────────────────────────────────────────────────

    pub fn put_postmortem(&self, stub: &PostmortemStub) -> StateResult<()> {
        let value = serde_json::to_vec(stub).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(POSTMORTEMS).map_err(map_err!(Table))?;
            table
                .insert(stub.release_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_postmortem(&self, release_id: &str) -> StateResult<Option<PostmortemStub>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POSTMORTEMS).map_err(map_err!(Table))?;
        match table.get(release_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let stub: PostmortemStub =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(stub))
            }
            None => Ok(None),
        }
    }

    // ── Waivers ────────────────────────────────────────────────────

    /// Insert or replace the waiver for a project check.
    pub fn put_waiver(&self, waiver: &WaiverRecord) -> StateResult<()> {
        let key = waiver.table_key();
        let value = serde_json::to_vec(waiver).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WAIVERS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, expires_at = waiver.expires_at, "waiver stored");
        Ok(())
    }

    /// All waivers recorded for a project, expired or not.
    pub fn list_waivers(&self, project: &str) -> StateResult<Vec<WaiverRecord>> {
        let prefix = format!("{project}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WAIVERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let waiver: WaiverRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(waiver);
            }
        }
        Ok(results)
    }
}

impl ReleaseStore for StateStore {
    fn append_audit_entry(&self, entry: &AuditEntry) -> StateResult<u64> {
        self.append_audit(entry)
    }

    fn save_release(&self, release: &Release) -> StateResult<()> {
        self.put_release(release)
    }

    fn load_release(&self, id: &str) -> StateResult<Option<Release>> {
        self.get_release(id)
    }

    fn load_active_release(&self, project: &str, environment: &str) -> StateResult<Option<Release>> {
        self.get_active_release(project, environment)
    }

    fn audit_trail(&self, release_id: &str) -> StateResult<Vec<AuditEntry>> {
        self.list_audit_for_release(release_id)
    }

    fn save_postmortem(&self, stub: &PostmortemStub) -> StateResult<()> {
        self.put_postmortem(stub)
    }

    fn load_postmortem(&self, release_id: &str) -> StateResult<Option<PostmortemStub>> {
        self.get_postmortem(release_id)
    }

    fn list_releases(&self) -> StateResult<Vec<Release>> {
        StateStore::list_releases(self)
    }
}
