//! redb table definitions for the release store.
//!
//! String-keyed tables hold JSON-serialized domain types. The audit table
//! is keyed by a monotonically increasing sequence number so iteration
//! order is append order.

use redb::TableDefinition;

/// Releases keyed by release id.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// Active release id keyed by `{project}/{environment}`.
pub const ACTIVE_RELEASES: TableDefinition<&str, &str> = TableDefinition::new("active_releases");

/// Audit entries keyed by sequence number.
pub const AUDIT: TableDefinition<u64, &[u8]> = TableDefinition::new("audit");

/// Stage attempts keyed by `{scope}:{stage}:{attempt:04}`.
pub const STAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("stages");

/// Postmortem stubs keyed by release id.
pub const POSTMORTEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("postmortems");

/// Policy waivers keyed by `{project}/{check_name}`.
pub const WAIVERS: TableDefinition<&str, &[u8]> = TableDefinition::new("waivers");
