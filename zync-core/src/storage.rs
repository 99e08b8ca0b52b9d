//! Storage traits and errors.
//!
//! The CVR store persists the two-tier structure described by the data
//! model: metadata (instances, clients, queries, desires) and row records
//! with their consistency marker. Implementations live in `zync-storage`;
//! the view-syncer only speaks these traits.

use crate::models::cvr::{CvrFlush, CvrSnapshot};
use crate::models::permissions::PermissionsConfig;
use crate::models::row::RowRecord;
use crate::models::version::CvrVersion;
use crate::models::{ClientGroupId, QueryHash};
use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum StorageError {
    #[error("Could not find {0} with id `{1}`!")]
    NotFound(String, String),
    #[error("The entity {0} with id {1} was already present!")]
    DuplicateEntry(String, String),
    #[error("CVR for client group {group} is owned by {owner:?}")]
    OwnershipConflict { group: ClientGroupId, owner: Option<String> },
    #[error("Timed out waiting for rows version to reach {0}")]
    RowsVersionTimeout(String),
    #[error("Currently unsupported: {0}")]
    Unsupported(String),
    #[error("Unexpected storage error: {0}")]
    Unexpected(String),
}

/// Stored compiled permissions: the config plus its content hash.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredPermissions {
    pub config: PermissionsConfig,
    pub hash: String,
}

/// Persistent store for one client group's view record.
///
/// A store instance is scoped to a single group and owned by the
/// view-syncer holding the group's lease. `flush` enforces the lease with
/// a compare-and-set on the instance row's `version` and fails with
/// [`StorageError::OwnershipConflict`] when another instance took over.
#[async_trait]
pub trait CvrStore: Send + Sync + 'static {
    fn group_id(&self) -> &ClientGroupId;

    /// Loads the group's CVR metadata; a group never seen before yields a
    /// fresh initial snapshot.
    async fn load(&self) -> Result<CvrSnapshot, StorageError>;

    /// Loads all row records of the group. Called once at initialization
    /// to seed the in-memory row map; implementations page internally.
    async fn load_row_records(&self) -> Result<Vec<RowRecord>, StorageError>;

    /// Commits one CVR transaction. Metadata commits before this returns;
    /// row records may be deferred (write-back) and are then committed in
    /// version order by a background flusher.
    async fn flush(&self, flush: CvrFlush) -> Result<(), StorageError>;

    /// Whether row commits are still outstanding. When false,
    /// `cvr.instances.version == cvr.rows_version.version`.
    fn has_pending_row_updates(&self) -> bool;

    /// Waits (bounded) until the persisted rows are consistent with
    /// `version`, i.e. `rows_version >= version`.
    async fn await_consistent(&self, version: &CvrVersion) -> Result<(), StorageError>;

    /// Streams row records whose patch version falls in `(after, up_to]`,
    /// excluding live rows whose query hashes are being sent anew as part
    /// of a fresh hydration. Used for client catch-up.
    async fn catchup_row_records(
        &self,
        after: &CvrVersion,
        up_to: &CvrVersion,
        exclude_hashes: &BTreeSet<QueryHash>,
    ) -> Result<Vec<RowRecord>, StorageError>;

    /// Reads the compiled permissions row, if deployed.
    async fn load_permissions(&self) -> Result<Option<StoredPermissions>, StorageError>;

    /// Physically deletes tombstoned row records whose patch version is at
    /// or below `before`; callers pass the minimum acknowledged cookie
    /// across connected clients. Returns the number of records removed.
    async fn compact_tombstones(&self, before: &CvrVersion) -> Result<u64, StorageError>;
}
