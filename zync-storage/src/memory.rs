//! Pure in-memory CVR store.
//!
//! Keeps the metadata and row tiers in `BTreeMap`s behind a mutex, with
//! write-through commit semantics (`rows_version` always equals the
//! instance version after a flush). Used by tests and local development;
//! the semantics mirror the postgres store, including the version
//! compare-and-set on flush.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use zync_core::models::cvr::{CvrFlush, CvrSnapshot};
use zync_core::models::row::{RowId, RowRecord};
use zync_core::models::version::CvrVersion;
use zync_core::storage::{CvrStore, StorageError, StoredPermissions};
use zync_core::{ClientGroupId, QueryHash};

#[derive(Default)]
struct State {
    snapshot: Option<CvrSnapshot>,
    rows: BTreeMap<RowId, RowRecord>,
    rows_version: Option<CvrVersion>,
    permissions: Option<StoredPermissions>,
}

pub struct MemCvrStore {
    group: ClientGroupId,
    state: Mutex<State>,
}

impl MemCvrStore {
    pub fn new(group: impl Into<ClientGroupId>) -> Self {
        Self { group: group.into(), state: Mutex::new(State::default()) }
    }

    /// Installs a compiled permissions row, as a deployment would.
    pub fn set_permissions(&self, stored: StoredPermissions) {
        self.state.lock().expect("state lock poisoned").permissions = Some(stored);
    }

    /// Test hook: the currently persisted rows version.
    pub fn rows_version(&self) -> Option<CvrVersion> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .rows_version
            .clone()
    }

    /// Test hook: a copy of the persisted row records.
    pub fn rows(&self) -> BTreeMap<RowId, RowRecord> {
        self.state.lock().expect("state lock poisoned").rows.clone()
    }
}

#[async_trait]
impl CvrStore for MemCvrStore {
    fn group_id(&self) -> &ClientGroupId {
        &self.group
    }

    async fn load(&self) -> Result<CvrSnapshot, StorageError> {
        let state = self.state.lock().expect("state lock poisoned");
        Ok(state
            .snapshot
            .clone()
            .unwrap_or_else(|| CvrSnapshot::new(self.group.clone(), Default::default())))
    }

    async fn load_row_records(&self) -> Result<Vec<RowRecord>, StorageError> {
        let state = self.state.lock().expect("state lock poisoned");
        Ok(state.rows.values().cloned().collect())
    }

    async fn flush(&self, flush: CvrFlush) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("state lock poisoned");

        let mut snapshot = match state.snapshot.take() {
            Some(snapshot) => {
                if snapshot.version != flush.expected_version {
                    let owner = snapshot.owner.clone();
                    state.snapshot = Some(snapshot);
                    return Err(StorageError::OwnershipConflict {
                        group: self.group.clone(),
                        owner,
                    });
                }
                snapshot
            }
            None => CvrSnapshot::new(self.group.clone(), flush.last_active),
        };

        snapshot.version = flush.version.clone();
        snapshot.last_active = flush.last_active;
        snapshot.replica_version = flush.replica_version.clone();
        snapshot.owner = Some(flush.owner.clone());
        snapshot.granted_at = Some(flush.granted_at);
        for client in &flush.clients {
            snapshot
                .clients
                .insert(client.id.clone(), client.clone());
        }
        for query in &flush.queries {
            snapshot
                .queries
                .insert(query.hash.clone(), query.clone());
        }
        for desire in &flush.desires {
            snapshot.desires.insert(
                (desire.client_id.clone(), desire.query_hash.clone()),
                desire.clone(),
            );
        }
        state.snapshot = Some(snapshot);

        for (id, record) in &flush.rows {
            state.rows.insert(id.clone(), record.clone());
        }
        state.rows_version = Some(flush.version);
        Ok(())
    }

    fn has_pending_row_updates(&self) -> bool {
        false
    }

    async fn await_consistent(&self, version: &CvrVersion) -> Result<(), StorageError> {
        let state = self.state.lock().expect("state lock poisoned");
        match &state.rows_version {
            Some(v) if v >= version => Ok(()),
            _ => Err(StorageError::RowsVersionTimeout(version.cookie())),
        }
    }

    async fn catchup_row_records(
        &self,
        after: &CvrVersion,
        up_to: &CvrVersion,
        exclude_hashes: &BTreeSet<QueryHash>,
    ) -> Result<Vec<RowRecord>, StorageError> {
        let state = self.state.lock().expect("state lock poisoned");
        let mut records: Vec<RowRecord> = state
            .rows
            .values()
            .filter(|r| &r.patch_version > after && &r.patch_version <= up_to)
            .filter(|r| match &r.ref_counts {
                None => true,
                Some(counts) => !counts.keys().any(|h| exclude_hashes.contains(h)),
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.patch_version.cmp(&b.patch_version));
        Ok(records)
    }

    async fn load_permissions(&self) -> Result<Option<StoredPermissions>, StorageError> {
        Ok(self
            .state
            .lock()
            .expect("state lock poisoned")
            .permissions
            .clone())
    }

    async fn compact_tombstones(&self, before: &CvrVersion) -> Result<u64, StorageError> {
        let mut state = self.state.lock().expect("state lock poisoned");
        let doomed: Vec<RowId> = state
            .rows
            .iter()
            .filter(|(_, r)| r.is_tombstone() && &r.patch_version <= before)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            state.rows.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
