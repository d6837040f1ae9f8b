//! Live controllers keyed by release id and by project environment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::controller::ReleaseHandle;

#[derive(Default)]
pub struct Registry {
    /// `project/env` → id of the newest release admitted there.
    by_env: HashMap<String, String>,
    handles: HashMap<String, ReleaseHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The non-terminal release for `env_key`, if its controller is known.
    pub fn active(&self, env_key: &str) -> Option<&ReleaseHandle> {
        let id = self.by_env.get(env_key)?;
        self.handles
            .get(id)
            .filter(|h| !h.snapshot().is_terminal())
    }

    pub fn get(&self, release_id: &str) -> Option<&ReleaseHandle> {
        self.handles.get(release_id)
    }

    pub fn contains(&self, release_id: &str) -> bool {
        self.handles.contains_key(release_id)
    }

    /// Register a controller, dropping handles of releases that finished.
    pub fn insert(&mut self, env_key: String, handle: ReleaseHandle) {
        self.handles
            .retain(|_, h| !(h.is_finished() && h.snapshot().is_terminal()));
        self.by_env.insert(env_key, handle.id().to_string());
        self.handles.insert(handle.id().to_string(), handle);
    }

    pub fn handles(&self) -> impl Iterator<Item = &ReleaseHandle> {
        self.handles.values()
    }
}

/// Environments with an admission in flight, keyed `project/env` → id of
/// the release being admitted.
///
/// A claim is taken under the registry lock and released when its guard
/// drops, so an admission can wait on a superseded rollback without
/// holding that lock.
#[derive(Clone, Default)]
pub struct Admissions {
    claims: Arc<Mutex<HashMap<String, String>>>,
}

impl Admissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the release currently being admitted for `env_key`.
    pub fn holder(&self, env_key: &str) -> Option<String> {
        self.claims.lock().ok()?.get(env_key).cloned()
    }

    pub fn claim(&self, env_key: &str, release_id: &str) -> Admission {
        if let Ok(mut claims) = self.claims.lock() {
            claims.insert(env_key.to_string(), release_id.to_string());
        }
        Admission {
            claims: self.claims.clone(),
            env_key: env_key.to_string(),
        }
    }
}

/// Releases its environment claim on drop.
pub struct Admission {
    claims: Arc<Mutex<HashMap<String, String>>>,
    env_key: String,
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.remove(&self.env_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_released_on_drop() {
        let admissions = Admissions::new();
        let admission = admissions.claim("shop/production", "rel-2");
        assert_eq!(admissions.holder("shop/production").as_deref(), Some("rel-2"));
        assert_eq!(admissions.holder("shop/staging"), None);

        drop(admission);
        assert_eq!(admissions.holder("shop/production"), None);
    }
}
