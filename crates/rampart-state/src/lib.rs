//! rampart-state — Durable release state backed by redb.
//!
//! Persists releases, the single-active-release index per project
//! environment, the append-only audit trail, scheduler stage attempts
//! (the idempotency cache), postmortem stubs, and policy waivers.
//!
//! # Usage
//!
//! ```no_run
//! use rampart_state::StateStore;
//!
//! let store = StateStore::open("/var/lib/rampart/state.redb".as_ref()).unwrap();
//! let active = store.get_active_release("shop", "production").unwrap();
//! ```

pub mod error;
pub mod persistence;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use persistence::ReleaseStore;
pub use store::StateStore;
pub use types::*;
