//! In-memory CVR state and its updaters.
//!
//! The view-syncer instance holding the lease owns the authoritative
//! image of the group's CVR: the metadata snapshot plus the row-record
//! map (which may lead the persisted rows table while flushes are
//! deferred). Two updaters mutate it:
//!
//! * [`ConfigUpdate`] covers query-set and client-set changes between
//!   replica transactions and bumps the minor version;
//! * [`AdvanceUpdate`] folds pipeline row changes into row records,
//!   assigning them the new patch version, and handles got transitions,
//!   query removals and re-hydration reconciliation.
//!
//! Both produce the persistent [`CvrFlush`] and the poke patches tagged
//! with the version they move a client to.

use crate::ivm::RowChange;
use crate::keys::{KeyColumns, KeyColumnsError};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::debug;
use zync_core::json::{ensure_safe_integers, JsonError};
use zync_core::models::cvr::{
    ClientRecord, CvrFlush, CvrSnapshot, DesireRecord, QueryRecord,
};
use zync_core::models::query::Ast;
use zync_core::models::row::{RowId, RowKey, RowRecord, RowValue};
use zync_core::models::schema::TableSpec;
use zync_core::models::version::{CvrVersion, StateVersion, VersionError};
use zync_core::protocol::{QueriesPatch, RowsPatch};
use zync_core::{ClientId, QueryHash, TableName};

#[derive(Error, Debug, PartialEq, Clone)]
pub enum UpdateError {
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error(transparent)]
    KeyColumns(#[from] KeyColumnsError),
    #[error(transparent)]
    UnsafeValue(#[from] JsonError),
    #[error("row of `{0}` is missing union key column `{1}`")]
    MissingKeyColumn(TableName, String),
    #[error("received change for unknown table `{0}`")]
    UnknownTable(TableName),
}

/// A poke patch together with the CVR version it brings a client to.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchToVersion {
    pub patch: Patch,
    pub to_version: CvrVersion,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Patch {
    DesiredQuery { client_id: ClientId, patch: QueriesPatch },
    GotQuery(QueriesPatch),
    Row(RowsPatch),
}

/// Everything a CVR transaction produced.
pub struct CvrUpdate {
    pub version: CvrVersion,
    pub flush: Option<CvrFlush>,
    pub patches: Vec<PatchToVersion>,
}

/// Ambient data every flush carries.
#[derive(Clone, Debug)]
pub struct FlushContext {
    pub now: chrono::NaiveDateTime,
    pub owner: String,
    pub granted_at: chrono::NaiveDateTime,
    pub replica_version: Option<StateVersion>,
}

pub struct CvrState {
    pub snapshot: CvrSnapshot,
    pub rows: HashMap<RowId, RowRecord>,
}

impl CvrState {
    pub fn new(snapshot: CvrSnapshot, rows: Vec<RowRecord>) -> Self {
        let rows = rows
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        Self { snapshot, rows }
    }

    pub fn version(&self) -> &CvrVersion {
        &self.snapshot.version
    }

    /// Begins a metadata-only update (query set / client set changes).
    pub fn config_update(&mut self) -> ConfigUpdate<'_> {
        let version = self.snapshot.version.next_minor();
        ConfigUpdate {
            state: self,
            version,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
            desires: BTreeMap::new(),
            patches: Vec::new(),
        }
    }

    /// Begins a row-driven update at the next minor version (used for
    /// hydration between replica transactions).
    pub fn advance_minor(&mut self) -> AdvanceUpdate<'_> {
        let version = self.snapshot.version.next_minor();
        AdvanceUpdate::at(self, version)
    }

    /// Begins a row-driven update for a replica transaction.
    pub fn advance_to(
        &mut self,
        state_version: StateVersion,
    ) -> Result<AdvanceUpdate<'_>, UpdateError> {
        let version = self.snapshot.version.advance_to(state_version)?;
        Ok(AdvanceUpdate::at(self, version))
    }

    /// Config patches for catch-up: got/del and desired put/del entries
    /// with a patch version after `after`.
    pub fn config_catchup_patches(&self, after: &CvrVersion) -> Vec<PatchToVersion> {
        let mut patches = Vec::new();
        for query in self.snapshot.queries.values() {
            let Some(patch_version) = &query.patch_version else {
                continue;
            };
            if patch_version <= after {
                continue;
            }
            let patch = if query.deleted {
                QueriesPatch::Del { hash: query.hash.clone() }
            } else {
                QueriesPatch::Put { hash: query.hash.clone(), ast: None }
            };
            patches.push(PatchToVersion {
                patch: Patch::GotQuery(patch),
                to_version: patch_version.clone(),
            });
        }
        for desire in self.snapshot.desires.values() {
            if desire.patch_version <= *after {
                continue;
            }
            let patch = if desire.deleted {
                QueriesPatch::Del { hash: desire.query_hash.clone() }
            } else {
                QueriesPatch::Put { hash: desire.query_hash.clone(), ast: None }
            };
            patches.push(PatchToVersion {
                patch: Patch::DesiredQuery { client_id: desire.client_id.clone(), patch },
                to_version: desire.patch_version.clone(),
            });
        }
        patches.sort_by(|a, b| a.to_version.cmp(&b.to_version));
        patches
    }

    /// Hashes that are got but no longer desired by any client.
    pub fn unreferenced_got_queries(&self) -> Vec<QueryHash> {
        let desired = self.snapshot.desired_query_hashes();
        self.snapshot
            .queries
            .values()
            .filter(|q| q.is_got() && !desired.contains(&q.hash))
            .map(|q| q.hash.clone())
            .collect()
    }
}

pub struct ConfigUpdate<'a> {
    state: &'a mut CvrState,
    version: CvrVersion,
    clients: BTreeMap<ClientId, ClientRecord>,
    queries: BTreeMap<QueryHash, QueryRecord>,
    desires: BTreeMap<(ClientId, QueryHash), DesireRecord>,
    patches: Vec<PatchToVersion>,
}

impl ConfigUpdate<'_> {
    pub fn ensure_client(&mut self, client_id: &ClientId) {
        if self.state.snapshot.clients.contains_key(client_id)
            || self.clients.contains_key(client_id)
        {
            return;
        }
        self.clients.insert(
            client_id.clone(),
            ClientRecord {
                id: client_id.clone(),
                patch_version: self.version.clone(),
                deleted: false,
            },
        );
    }

    pub fn put_desired_queries(&mut self, client_id: &ClientId, queries: &[(QueryHash, Ast)]) {
        self.ensure_client(client_id);
        for (hash, ast) in queries {
            let key = (client_id.clone(), hash.clone());
            let active = self
                .state
                .snapshot
                .desires
                .get(&key)
                .map(|d| !d.deleted)
                .unwrap_or(false);
            if active {
                continue;
            }
            self.desires.insert(
                key,
                DesireRecord {
                    client_id: client_id.clone(),
                    query_hash: hash.clone(),
                    patch_version: self.version.clone(),
                    deleted: false,
                },
            );
            if !self.state.snapshot.queries.contains_key(hash)
                && !self.queries.contains_key(hash)
            {
                self.queries
                    .insert(hash.clone(), QueryRecord::new(hash.clone(), ast.clone()));
            }
            self.patches.push(PatchToVersion {
                patch: Patch::DesiredQuery {
                    client_id: client_id.clone(),
                    patch: QueriesPatch::Put { hash: hash.clone(), ast: Some(ast.clone()) },
                },
                to_version: self.version.clone(),
            });
        }
    }

    pub fn del_desired_queries(&mut self, client_id: &ClientId, hashes: &[QueryHash]) {
        for hash in hashes {
            let key = (client_id.clone(), hash.clone());
            let Some(existing) = self.state.snapshot.desires.get(&key) else {
                continue;
            };
            if existing.deleted {
                continue;
            }
            self.desires.insert(
                key,
                DesireRecord {
                    client_id: client_id.clone(),
                    query_hash: hash.clone(),
                    patch_version: self.version.clone(),
                    deleted: true,
                },
            );
            self.patches.push(PatchToVersion {
                patch: Patch::DesiredQuery {
                    client_id: client_id.clone(),
                    patch: QueriesPatch::Del { hash: hash.clone() },
                },
                to_version: self.version.clone(),
            });
        }
    }

    /// Removes client records and drops all their desires.
    pub fn delete_clients(&mut self, client_ids: &[ClientId]) {
        for client_id in client_ids {
            let desired: Vec<QueryHash> = self
                .state
                .snapshot
                .desired_by_client(client_id)
                .into_iter()
                .collect();
            self.del_desired_queries(client_id, &desired);
            if let Some(existing) = self.state.snapshot.clients.get(client_id) {
                if !existing.deleted {
                    self.clients.insert(
                        client_id.clone(),
                        ClientRecord {
                            id: client_id.clone(),
                            patch_version: self.version.clone(),
                            deleted: true,
                        },
                    );
                }
            }
        }
    }

    /// Applies the changes to the snapshot and builds the flush. Returns
    /// an update with `flush: None` when nothing changed.
    pub fn finish(self, ctx: &FlushContext) -> CvrUpdate {
        let changed =
            !self.clients.is_empty() || !self.queries.is_empty() || !self.desires.is_empty();
        if !changed {
            return CvrUpdate {
                version: self.state.snapshot.version.clone(),
                flush: None,
                patches: Vec::new(),
            };
        }

        let expected = self.state.snapshot.version.clone();
        self.state.snapshot.version = self.version.clone();
        self.state.snapshot.last_active = ctx.now;
        for (id, record) in &self.clients {
            self.state
                .snapshot
                .clients
                .insert(id.clone(), record.clone());
        }
        for (hash, record) in &self.queries {
            self.state
                .snapshot
                .queries
                .insert(hash.clone(), record.clone());
        }
        for (key, record) in &self.desires {
            self.state
                .snapshot
                .desires
                .insert(key.clone(), record.clone());
        }

        debug!(version = %self.version, "applied CVR config update");
        CvrUpdate {
            version: self.version.clone(),
            flush: Some(CvrFlush {
                group_id: self.state.snapshot.id.clone(),
                expected_version: expected,
                version: self.version,
                last_active: ctx.now,
                replica_version: ctx
                    .replica_version
                    .clone()
                    .or_else(|| self.state.snapshot.replica_version.clone()),
                owner: ctx.owner.clone(),
                granted_at: ctx.granted_at,
                clients: self.clients.into_values().collect(),
                queries: self.queries.into_values().collect(),
                desires: self.desires.into_values().collect(),
                rows: HashMap::new(),
            }),
            patches: self.patches,
        }
    }
}

pub struct AdvanceUpdate<'a> {
    state: &'a mut CvrState,
    version: CvrVersion,
    key_columns: KeyColumns,
    /// Merged working copies of changed row records.
    rows: HashMap<RowId, RowRecord>,
    queries: BTreeMap<QueryHash, QueryRecord>,
    patches: Vec<PatchToVersion>,
    /// Hashes being re-hydrated authoritatively: rows they referenced but
    /// which were not seen again lose their refcounts at `finish`.
    rehydrating: BTreeMap<QueryHash, HashSet<RowId>>,
    /// Row versions already sent as puts within this update.
    put_versions: HashMap<RowId, String>,
}

impl<'a> AdvanceUpdate<'a> {
    fn at(state: &'a mut CvrState, version: CvrVersion) -> Self {
        let key_columns = KeyColumns::new(state.rows.values());
        AdvanceUpdate {
            state,
            version,
            key_columns,
            rows: HashMap::new(),
            queries: BTreeMap::new(),
            patches: Vec::new(),
            rehydrating: BTreeMap::new(),
            put_versions: HashMap::new(),
        }
    }

    pub fn version(&self) -> &CvrVersion {
        &self.version
    }

    /// Marks `hash` as authoritatively re-hydrated: after all received
    /// changes, rows it referenced that were not seen again are released.
    pub fn begin_rehydrate(&mut self, hash: &QueryHash) {
        self.rehydrating
            .entry(hash.clone())
            .or_default();
        // Start the hash's refcounts from zero in the working copies.
        let affected: Vec<RowId> = self
            .state
            .rows
            .iter()
            .filter(|(_, r)| {
                r.ref_counts
                    .as_ref()
                    .map(|c| c.contains_key(hash))
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        let version = self.version.clone();
        for id in affected {
            let record = self.working_record(&id);
            record.patch_version = version.clone();
            if let Some(counts) = &record.ref_counts {
                if let Some(count) = counts.get(hash).copied() {
                    record.apply_ref_count(hash, -count);
                }
            }
        }
    }

    /// Marks the query as got at this update's version.
    pub fn mark_got(&mut self, hash: &QueryHash, ast: &Ast, transformation_hash: &str) {
        let mut record = self
            .state
            .snapshot
            .queries
            .get(hash)
            .cloned()
            .unwrap_or_else(|| QueryRecord::new(hash.clone(), ast.clone()));
        record.deleted = false;
        record.transformation_hash = Some(transformation_hash.to_string());
        record.transformation_version = Some(self.version.clone());
        record.patch_version = Some(self.version.clone());
        self.queries.insert(hash.clone(), record);
        self.patches.push(PatchToVersion {
            patch: Patch::GotQuery(QueriesPatch::Put { hash: hash.clone(), ast: None }),
            to_version: self.version.clone(),
        });
    }

    /// Removes a got query: its rows lose their references and the query
    /// record becomes a tombstone.
    pub fn remove_query(&mut self, hash: &QueryHash) {
        if let Some(existing) = self.state.snapshot.queries.get(hash) {
            let mut record = existing.clone();
            record.deleted = true;
            record.transformation_hash = None;
            record.transformation_version = None;
            record.patch_version = Some(self.version.clone());
            self.queries.insert(hash.clone(), record);
        }
        self.begin_rehydrate(hash);
        self.patches.push(PatchToVersion {
            patch: Patch::GotQuery(QueriesPatch::Del { hash: hash.clone() }),
            to_version: self.version.clone(),
        });
    }

    fn working_record(&mut self, id: &RowId) -> &mut RowRecord {
        if !self.rows.contains_key(id) {
            let record = self
                .state
                .rows
                .get(id)
                .cloned()
                .unwrap_or_else(|| RowRecord {
                    id: id.clone(),
                    row_version: String::new(),
                    patch_version: self.version.clone(),
                    ref_counts: None,
                });
            self.rows.insert(id.clone(), record);
        }
        self.rows.get_mut(id).expect("inserted above")
    }

    fn union_row_id(
        &self,
        spec: &TableSpec,
        value: &RowValue,
    ) -> Result<RowId, UpdateError> {
        let mut key = RowValue::new();
        for column in spec.union_key_columns() {
            let v = value.get(&column).ok_or_else(|| {
                UpdateError::MissingKeyColumn(spec.name.clone(), column.clone())
            })?;
            key.insert(column, v.clone());
        }
        let row_key = RowKey::new(key).map_err(UpdateError::UnsafeValue)?;
        Ok(RowId::new(spec.schema.clone(), spec.name.clone(), row_key))
    }

    /// Resolves the record identity for an emitted row: when the CVR
    /// still keys this table by an older column set, the change applies
    /// to the existing record.
    fn resolve_id(&self, new_id: RowId, value: &RowValue) -> Result<RowId, UpdateError> {
        if self.state.rows.contains_key(&new_id) || self.rows.contains_key(&new_id) {
            return Ok(new_id);
        }
        for old_id in self.key_columns.old_row_ids(&new_id, value)? {
            if self.state.rows.contains_key(&old_id) || self.rows.contains_key(&old_id) {
                return Ok(old_id);
            }
        }
        Ok(new_id)
    }

    /// Folds one pipeline change for `hash` into the row records.
    /// `projected` is the row value as it may be sent to clients (cell
    /// guards applied).
    pub fn received(
        &mut self,
        hash: &QueryHash,
        specs: &BTreeMap<TableName, TableSpec>,
        change: &RowChange,
        projected: Option<RowValue>,
    ) -> Result<(), UpdateError> {
        let change = change.flatten();
        let (table, row_version, value, old_value, delta) = match change {
            RowChange::Add { table, row } => (table, &row.version, &row.value, None, 1),
            RowChange::Edit { table, old, row } => {
                (table, &row.version, &row.value, Some(&old.value), 0)
            }
            RowChange::Remove { table, row } => (table, &row.version, &row.value, None, -1),
            RowChange::Child { .. } => unreachable!("flatten strips child nesting"),
        };
        let spec = specs
            .get(table)
            .ok_or_else(|| UpdateError::UnknownTable(table.clone()))?;

        // An edit whose union key moved arrives as remove+add from the
        // driver; here the key is stable, but an older CVR key set may
        // still apply.
        let id = self.union_row_id(spec, old_value.unwrap_or(value))?;
        let id = self.resolve_id(id, value)?;

        if let Some(seen) = self
            .rehydrating
            .get_mut(hash)
        {
            if delta >= 0 {
                seen.insert(id.clone());
            }
        }

        let version = self.version.clone();
        let prior = self.state.rows.get(&id).cloned();
        let merged = {
            let record = self.working_record(&id);
            record.patch_version = version.clone();
            if delta != 0 {
                record.apply_ref_count(hash, delta);
            }
            if delta >= 0 {
                record.row_version = row_version.clone();
            }
            record.clone()
        };

        if delta < 0 {
            if merged.is_tombstone() {
                self.patches.push(PatchToVersion {
                    patch: Patch::Row(RowsPatch::Del {
                        table_name: table.clone(),
                        id: id.row_key.clone(),
                    }),
                    to_version: version,
                });
            }
            // Still referenced by another query: the client keeps the
            // row, no patch needed.
        } else {
            let value = projected.unwrap_or_else(|| value.clone());
            ensure_safe_integers(
                &format!("{}.{}", table, id.row_key.canonical()),
                &Value::Object(value.clone()),
            )?;
            // Collapse no-op updates: a client that already holds this
            // row version needs nothing.
            let client_has_version = prior
                .as_ref()
                .map(|p| !p.is_tombstone() && p.row_version == *row_version)
                .unwrap_or(false)
                || self.put_versions.get(&id) == Some(row_version);
            if !client_has_version {
                self.put_versions
                    .insert(id.clone(), row_version.clone());
                self.patches.push(PatchToVersion {
                    patch: Patch::Row(RowsPatch::Put { table_name: table.clone(), value }),
                    to_version: version,
                });
            }
        }

        // A record the update left exactly as the state has it needs no
        // flush and keeps its old patch version.
        if let Some(prior) = &prior {
            if prior.ref_counts == merged.ref_counts && prior.row_version == merged.row_version {
                self.rows.remove(&id);
            }
        }
        Ok(())
    }

    /// Finishes the update: reconciles re-hydrated hashes, applies the
    /// working copies to the state and builds the flush.
    pub fn finish(mut self, ctx: &FlushContext) -> CvrUpdate {
        // Release rows a re-hydrated query no longer produces.
        let rehydrating = std::mem::take(&mut self.rehydrating);
        for (hash, seen) in &rehydrating {
            let stale: Vec<RowId> = self
                .rows
                .iter()
                .filter(|(id, record)| {
                    !seen.contains(*id)
                        && record
                            .ref_counts
                            .as_ref()
                            .map(|c| !c.contains_key(hash))
                            .unwrap_or(true)
                })
                .filter(|(id, record)| {
                    // Only rows that previously referenced the hash and
                    // became tombstones need a delete patch.
                    record.is_tombstone()
                        && self
                            .state
                            .rows
                            .get(*id)
                            .and_then(|p| p.ref_counts.as_ref())
                            .map(|c| c.contains_key(hash))
                            .unwrap_or(false)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                let table = id.table.clone();
                self.patches.push(PatchToVersion {
                    patch: Patch::Row(RowsPatch::Del {
                        table_name: table,
                        id: id.row_key.clone(),
                    }),
                    to_version: self.version.clone(),
                });
            }
        }

        let expected = self.state.snapshot.version.clone();
        let changed = !self.rows.is_empty() || !self.queries.is_empty();
        let version_advanced = self.version != expected;
        if !changed && !version_advanced {
            return CvrUpdate {
                version: expected,
                flush: None,
                patches: Vec::new(),
            };
        }

        self.state.snapshot.version = self.version.clone();
        self.state.snapshot.last_active = ctx.now;
        if let Some(replica_version) = &ctx.replica_version {
            self.state.snapshot.replica_version = Some(replica_version.clone());
        }
        for (hash, record) in &self.queries {
            self.state
                .snapshot
                .queries
                .insert(hash.clone(), record.clone());
        }
        for (id, record) in &self.rows {
            self.state.rows.insert(id.clone(), record.clone());
        }

        debug!(
            version = %self.version,
            rows = self.rows.len(),
            queries = self.queries.len(),
            "applied CVR advance"
        );
        CvrUpdate {
            version: self.version.clone(),
            flush: Some(CvrFlush {
                group_id: self.state.snapshot.id.clone(),
                expected_version: expected,
                version: self.version,
                last_active: ctx.now,
                replica_version: ctx
                    .replica_version
                    .clone()
                    .or_else(|| self.state.snapshot.replica_version.clone()),
                owner: ctx.owner.clone(),
                granted_at: ctx.granted_at,
                clients: Vec::new(),
                queries: self.queries.into_values().collect(),
                desires: Vec::new(),
                rows: self.rows,
            }),
            patches: self.patches,
        }
    }
}

/// Row catch-up patches for a lagging client: tombstones become deletes,
/// live records resolve their current contents by key lookup.
pub fn row_catchup_patches(
    records: &[RowRecord],
    lookup: &mut dyn FnMut(&RowId) -> Option<RowValue>,
) -> Vec<PatchToVersion> {
    let mut patches = Vec::new();
    for record in records {
        if record.is_tombstone() {
            patches.push(PatchToVersion {
                patch: Patch::Row(RowsPatch::Del {
                    table_name: record.id.table.clone(),
                    id: record.id.row_key.clone(),
                }),
                to_version: record.patch_version.clone(),
            });
        } else if let Some(value) = lookup(&record.id) {
            patches.push(PatchToVersion {
                patch: Patch::Row(RowsPatch::Put {
                    table_name: record.id.table.clone(),
                    value,
                }),
                to_version: record.patch_version.clone(),
            });
        }
        // A live record whose row is gone from the snapshot is covered by
        // a newer tombstone later in the window.
    }
    patches
}

/// Extracts the hashes a set of desires references, used to exclude
/// freshly hydrating queries from catch-up.
pub fn hashes_of(patches: &[PatchToVersion]) -> BTreeSet<QueryHash> {
    patches
        .iter()
        .filter_map(|p| match &p.patch {
            Patch::GotQuery(QueriesPatch::Put { hash, .. }) => Some(hash.clone()),
            _ => None,
        })
        .collect()
}
