//! The snapshotter: versioned read snapshots plus inter-snapshot diffs.

use crate::replica::{Replica, ReplicaError, ReplicaSnapshot, RowDiff};
use std::sync::Arc;
use tracing::debug;
use zync_core::models::version::StateVersion;

/// Owns the replica snapshot the pipelines currently read from and
/// produces the row-level diff when advancing to the replica's head.
pub struct Snapshotter {
    replica: Arc<dyn Replica>,
    current: Arc<dyn ReplicaSnapshot>,
}

/// Result of an advance: the previous snapshot stays alive inside the
/// diff so removals can be resolved against pre-change state.
pub struct SnapshotDiff {
    pub prev: Arc<dyn ReplicaSnapshot>,
    pub curr: Arc<dyn ReplicaSnapshot>,
    pub changes: Vec<RowDiff>,
}

impl SnapshotDiff {
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }
}

impl Snapshotter {
    /// Opens a read snapshot at the replica's head.
    pub fn init(replica: Arc<dyn Replica>) -> Result<Self, ReplicaError> {
        let current = replica.snapshot()?;
        debug!(version = %current.state_version(), "opened initial replica snapshot");
        Ok(Self { replica, current })
    }

    pub fn current(&self) -> &Arc<dyn ReplicaSnapshot> {
        &self.current
    }

    /// Moves to the replica's head and returns the per-row diffs between
    /// the old and new snapshot. On failure the old snapshot is retained.
    pub fn advance(&mut self) -> Result<SnapshotDiff, ReplicaError> {
        let next = self.replica.snapshot()?;
        let changes = self
            .replica
            .diff(&self.current.state_version(), &next.state_version())?;
        let prev = std::mem::replace(&mut self.current, next);
        debug!(
            from = %prev.state_version(),
            to = %self.current.state_version(),
            changes = changes.len(),
            "advanced replica snapshot"
        );
        Ok(SnapshotDiff { prev, curr: self.current.clone(), changes })
    }

    /// Moves to the replica's head without diffing; used when no pipeline
    /// depends on row-level changes.
    pub fn advance_without_diff(&mut self) -> Result<StateVersion, ReplicaError> {
        self.current = self.replica.snapshot()?;
        Ok(self.current.state_version())
    }
}
