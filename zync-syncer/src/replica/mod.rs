//! The replica snapshot interface the view-syncer consumes.
//!
//! The replica is a versioned relational database maintained elsewhere by
//! the replication ingest. The view-syncer needs point-in-time snapshots,
//! table scans and key lookups within a snapshot, inter-snapshot row
//! diffs and head-version notifications. [`memory::MemReplica`] provides
//! these semantics in-process for tests and local development.

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use zync_core::models::row::{RowKey, RowValue};
use zync_core::models::schema::{SchemaVersions, TableSpec};
use zync_core::models::version::StateVersion;
use zync_core::TableName;

pub mod memory;

pub use memory::MemReplica;

/// Replicated system table tracking `lastMutationID` per (group, client);
/// its diffs drive the `lastMutationIDChanges` poke field.
pub const CLIENTS_TABLE: &str = "zync_clients";

#[derive(Error, Debug, PartialEq, Clone)]
pub enum ReplicaError {
    #[error("failed to open replica snapshot: {0}")]
    Snapshot(String),
    #[error("replica does not contain table `{0}`")]
    UnknownTable(TableName),
    #[error("failed to diff versions {0}..{1}: {2}")]
    Diff(StateVersion, StateVersion, String),
    #[error("malformed row: {0}")]
    MalformedRow(String),
}

/// One row as stored in the replica. `version` is the replica-assigned
/// per-row version used for change detection.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaRow {
    pub value: RowValue,
    pub version: String,
}

/// One entry of an inter-snapshot diff.
#[derive(Clone, Debug, PartialEq)]
pub struct RowDiff {
    pub table: TableName,
    pub prev: Option<ReplicaRow>,
    pub next: Option<ReplicaRow>,
}

/// A consistent point-in-time view of the replica. The handle stays valid
/// until dropped, in particular while a diff against a newer snapshot is
/// being consumed.
pub trait ReplicaSnapshot: Send + Sync {
    /// Version of the replica transaction this snapshot reflects.
    fn state_version(&self) -> StateVersion;

    /// Version at which the replica itself was (re)created; changes only
    /// on a full re-sync from upstream.
    fn replica_version(&self) -> StateVersion;

    /// Client schema versions this replica can serve.
    fn schema_versions(&self) -> SchemaVersions;

    /// Specs of all replicated tables.
    fn table_specs(&self) -> BTreeMap<TableName, TableSpec>;

    /// All rows of a table, in unspecified order; sources impose ordering.
    fn rows(&self, table: &TableName) -> Result<Vec<ReplicaRow>, ReplicaError>;

    /// Primary-key lookup within the snapshot.
    fn get(&self, table: &TableName, key: &RowKey) -> Result<Option<ReplicaRow>, ReplicaError>;
}

/// Handle to the replica database.
pub trait Replica: Send + Sync + 'static {
    /// Opens a snapshot at the replica's current head.
    fn snapshot(&self) -> Result<Arc<dyn ReplicaSnapshot>, ReplicaError>;

    /// Per-row diffs between two snapshot versions, in deterministic
    /// order (table, then key). Multiple changes to one row coalesce into
    /// a single entry.
    fn diff(&self, from: &StateVersion, to: &StateVersion) -> Result<Vec<RowDiff>, ReplicaError>;

    /// Head state-version notifications.
    fn watch_head(&self) -> watch::Receiver<StateVersion>;
}
