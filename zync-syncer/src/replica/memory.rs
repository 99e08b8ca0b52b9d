//! In-memory replica.
//!
//! Tables are `BTreeMap`s keyed by primary key, snapshots are cheap
//! clones of the table maps and diffs come from a per-version changelog.
//! Not a storage engine; it exists to give tests and local development
//! the exact snapshot/diff/watch semantics the view-syncer consumes.

use super::{Replica, ReplicaError, ReplicaRow, ReplicaSnapshot, RowDiff};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use zync_core::models::row::{RowKey, RowValue};
use zync_core::models::schema::{SchemaVersions, TableSpec};
use zync_core::models::version::{encode_lexi, StateVersion};
use zync_core::TableName;

#[derive(Clone)]
struct TableState {
    spec: TableSpec,
    rows: BTreeMap<RowKey, ReplicaRow>,
}

struct Inner {
    seq: u64,
    row_seq: u64,
    state_version: StateVersion,
    replica_version: StateVersion,
    schema_versions: SchemaVersions,
    tables: BTreeMap<TableName, TableState>,
    changelog: Vec<(StateVersion, Vec<RowDiff>)>,
}

pub struct MemReplica {
    inner: Arc<Mutex<Inner>>,
    head_tx: watch::Sender<StateVersion>,
    _head_rx: watch::Receiver<StateVersion>,
}

impl MemReplica {
    pub fn new(schema_versions: SchemaVersions) -> Self {
        let initial = encode_lexi(1);
        let (head_tx, head_rx) = watch::channel(initial.clone());
        Self {
            inner: Arc::new(Mutex::new(Inner {
                seq: 1,
                row_seq: 0,
                state_version: initial.clone(),
                replica_version: initial,
                schema_versions,
                tables: BTreeMap::new(),
                changelog: Vec::new(),
            })),
            head_tx,
            _head_rx: head_rx,
        }
    }

    pub fn create_table(&self, spec: TableSpec) {
        let mut inner = self.inner.lock().expect("replica lock poisoned");
        inner
            .tables
            .insert(spec.name.clone(), TableState { spec, rows: BTreeMap::new() });
    }

    /// Begins a write transaction. Committing bumps the state version,
    /// assigns row versions and records the diffs.
    pub fn write(&self) -> WriteTx<'_> {
        WriteTx { replica: self, ops: Vec::new() }
    }

    pub fn head(&self) -> StateVersion {
        self.inner
            .lock()
            .expect("replica lock poisoned")
            .state_version
            .clone()
    }

    fn primary_key(spec: &TableSpec, value: &RowValue) -> Result<RowKey, ReplicaError> {
        let mut key = RowValue::new();
        for column in &spec.primary_key {
            let v = value.get(column).ok_or_else(|| {
                ReplicaError::MalformedRow(format!(
                    "row of `{}` is missing primary key column `{column}`",
                    spec.name
                ))
            })?;
            key.insert(column.clone(), v.clone());
        }
        RowKey::new(key).map_err(|e| ReplicaError::MalformedRow(e.to_string()))
    }
}

enum WriteOp {
    Upsert(RowValue),
    Delete(RowValue),
}

pub struct WriteTx<'a> {
    replica: &'a MemReplica,
    ops: Vec<(TableName, WriteOp)>,
}

impl WriteTx<'_> {
    pub fn upsert(mut self, table: impl Into<TableName>, value: RowValue) -> Self {
        self.ops.push((table.into(), WriteOp::Upsert(value)));
        self
    }

    /// Deletes by the row's primary key columns; extra columns are
    /// ignored.
    pub fn delete(mut self, table: impl Into<TableName>, value: RowValue) -> Self {
        self.ops.push((table.into(), WriteOp::Delete(value)));
        self
    }

    /// Applies the writes as one replica transaction and returns the new
    /// state version.
    pub fn commit(self) -> Result<StateVersion, ReplicaError> {
        let mut inner = self
            .replica
            .inner
            .lock()
            .expect("replica lock poisoned");
        let inner = &mut *inner;

        inner.seq += 1;
        inner.row_seq += 1;
        let version = encode_lexi(inner.seq);
        let row_version = encode_lexi(inner.row_seq);
        let mut diffs = Vec::new();

        for (table, op) in self.ops {
            let state = inner
                .tables
                .get_mut(&table)
                .ok_or_else(|| ReplicaError::UnknownTable(table.clone()))?;
            match op {
                WriteOp::Upsert(value) => {
                    let key = MemReplica::primary_key(&state.spec, &value)?;
                    let next = ReplicaRow { value, version: row_version.clone() };
                    let prev = state.rows.insert(key, next.clone());
                    diffs.push(RowDiff { table: table.clone(), prev, next: Some(next) });
                }
                WriteOp::Delete(value) => {
                    let key = MemReplica::primary_key(&state.spec, &value)?;
                    if let Some(prev) = state.rows.remove(&key) {
                        diffs.push(RowDiff { table: table.clone(), prev: Some(prev), next: None });
                    }
                }
            }
        }

        inner.state_version = version.clone();
        inner.changelog.push((version.clone(), diffs));
        let _ = self.replica.head_tx.send(version.clone());
        Ok(version)
    }
}

struct MemSnapshot {
    state_version: StateVersion,
    replica_version: StateVersion,
    schema_versions: SchemaVersions,
    tables: BTreeMap<TableName, TableState>,
}

impl ReplicaSnapshot for MemSnapshot {
    fn state_version(&self) -> StateVersion {
        self.state_version.clone()
    }

    fn replica_version(&self) -> StateVersion {
        self.replica_version.clone()
    }

    fn schema_versions(&self) -> SchemaVersions {
        self.schema_versions
    }

    fn table_specs(&self) -> BTreeMap<TableName, TableSpec> {
        self.tables
            .iter()
            .map(|(name, state)| (name.clone(), state.spec.clone()))
            .collect()
    }

    fn rows(&self, table: &TableName) -> Result<Vec<ReplicaRow>, ReplicaError> {
        let state = self
            .tables
            .get(table)
            .ok_or_else(|| ReplicaError::UnknownTable(table.clone()))?;
        Ok(state.rows.values().cloned().collect())
    }

    fn get(&self, table: &TableName, key: &RowKey) -> Result<Option<ReplicaRow>, ReplicaError> {
        let state = self
            .tables
            .get(table)
            .ok_or_else(|| ReplicaError::UnknownTable(table.clone()))?;
        Ok(state.rows.get(key).cloned())
    }
}

impl Replica for MemReplica {
    fn snapshot(&self) -> Result<Arc<dyn ReplicaSnapshot>, ReplicaError> {
        let inner = self.inner.lock().expect("replica lock poisoned");
        Ok(Arc::new(MemSnapshot {
            state_version: inner.state_version.clone(),
            replica_version: inner.replica_version.clone(),
            schema_versions: inner.schema_versions,
            tables: inner.tables.clone(),
        }))
    }

    fn diff(&self, from: &StateVersion, to: &StateVersion) -> Result<Vec<RowDiff>, ReplicaError> {
        if to < from {
            return Err(ReplicaError::Diff(
                from.clone(),
                to.clone(),
                "cannot diff backwards".to_string(),
            ));
        }
        let inner = self.inner.lock().expect("replica lock poisoned");

        // Coalesce per (table, key): prev from the first change, next from
        // the last. BTreeMap keys give the deterministic (table, key)
        // output order.
        let mut coalesced: BTreeMap<(TableName, String), RowDiff> = BTreeMap::new();
        for (version, diffs) in &inner.changelog {
            if version <= from || version > to {
                continue;
            }
            for diff in diffs {
                let spec = &inner
                    .tables
                    .get(&diff.table)
                    .ok_or_else(|| ReplicaError::UnknownTable(diff.table.clone()))?
                    .spec;
                let keyed = diff
                    .next
                    .as_ref()
                    .or(diff.prev.as_ref())
                    .expect("diff entries carry at least one side");
                let key = MemReplica::primary_key(spec, &keyed.value)?;
                coalesced
                    .entry((diff.table.clone(), key.canonical().to_string()))
                    .and_modify(|existing| existing.next = diff.next.clone())
                    .or_insert_with(|| diff.clone());
            }
        }

        Ok(coalesced
            .into_values()
            .filter(|d| d.prev != d.next)
            .collect())
    }

    fn watch_head(&self) -> watch::Receiver<StateVersion> {
        self.head_tx.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap as Map;
    use zync_core::models::schema::{ColumnSpec, ValueType};

    fn users_spec() -> TableSpec {
        TableSpec {
            schema: "public".to_string(),
            name: "users".to_string(),
            columns: [
                ("id".to_string(), ColumnSpec { data_type: ValueType::Text, not_null: true }),
                ("name".to_string(), ColumnSpec { data_type: ValueType::Text, not_null: false }),
            ]
            .into_iter()
            .collect::<Map<_, _>>(),
            primary_key: vec!["id".to_string()],
            unique_indexes: vec![],
        }
    }

    fn row(v: serde_json::Value) -> RowValue {
        v.as_object().unwrap().clone()
    }

    fn versions() -> SchemaVersions {
        SchemaVersions { min_supported_version: 1, max_supported_version: 1 }
    }

    #[test]
    fn test_snapshot_isolation() {
        let replica = MemReplica::new(versions());
        replica.create_table(users_spec());
        replica
            .write()
            .upsert("users", row(json!({"id": "u1", "name": "Alice"})))
            .commit()
            .unwrap();

        let before = replica.snapshot().unwrap();
        replica
            .write()
            .upsert("users", row(json!({"id": "u2", "name": "Bob"})))
            .commit()
            .unwrap();
        let after = replica.snapshot().unwrap();

        assert_eq!(before.rows(&"users".to_string()).unwrap().len(), 1);
        assert_eq!(after.rows(&"users".to_string()).unwrap().len(), 2);
        assert!(after.state_version() > before.state_version());
    }

    #[test]
    fn test_diff_coalesces_per_row() {
        let replica = MemReplica::new(versions());
        replica.create_table(users_spec());
        let from = replica.head();

        replica
            .write()
            .upsert("users", row(json!({"id": "u1", "name": "Alice"})))
            .commit()
            .unwrap();
        replica
            .write()
            .upsert("users", row(json!({"id": "u1", "name": "Alicia"})))
            .upsert("users", row(json!({"id": "u2", "name": "Bob"})))
            .commit()
            .unwrap();
        let to = replica.head();

        let diffs = replica.diff(&from, &to).unwrap();
        assert_eq!(diffs.len(), 2);
        // u1: insert + update coalesce to a single add.
        assert_eq!(diffs[0].prev, None);
        assert_eq!(diffs[0].next.as_ref().unwrap().value["name"], json!("Alicia"));
        assert_eq!(diffs[1].next.as_ref().unwrap().value["name"], json!("Bob"));
    }

    #[test]
    fn test_diff_insert_then_delete_vanishes() {
        let replica = MemReplica::new(versions());
        replica.create_table(users_spec());
        let from = replica.head();

        replica
            .write()
            .upsert("users", row(json!({"id": "u1", "name": "Alice"})))
            .commit()
            .unwrap();
        replica
            .write()
            .delete("users", row(json!({"id": "u1"})))
            .commit()
            .unwrap();

        let diffs = replica.diff(&from, &replica.head()).unwrap();
        assert_eq!(diffs, vec![]);
    }

    #[test]
    fn test_watch_head_notifies() {
        let replica = MemReplica::new(versions());
        replica.create_table(users_spec());
        let rx = replica.watch_head();
        let v = replica
            .write()
            .upsert("users", row(json!({"id": "u1", "name": "Alice"})))
            .commit()
            .unwrap();
        assert_eq!(*rx.borrow(), v);
    }
}
