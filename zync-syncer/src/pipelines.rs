//! The pipeline driver: owns one IVM graph per active query hash.
//!
//! The driver hydrates pipelines against the snapshotter's current
//! snapshot, folds inter-snapshot diffs through every pipeline on
//! `advance`, and enforces the advance circuit breaker: if, within the
//! first half of a diff, the elapsed time already exceeds the configured
//! share of the total hydration time, the advance aborts with
//! [`ResetPipelinesSignal`] and the caller must reset and re-hydrate.

use crate::ivm::{Pipeline, PipelineError, RowChange, SourceChange};
use crate::replica::{Replica, ReplicaError, ReplicaSnapshot, RowDiff};
use crate::snapshot::Snapshotter;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use zync_core::models::query::Ast;
use zync_core::models::schema::{ClientSchema, SchemaError, SchemaVersions, TableSpec};
use zync_core::models::version::StateVersion;
use zync_core::{QueryHash, TableName};

/// Raised when an advance runs long; recoverable by resetting the
/// pipelines and re-hydrating. Not a data loss.
#[derive(Error, Debug, PartialEq, Clone)]
#[error("advance exceeded the hydration time budget; reset and re-hydrate")]
pub struct ResetPipelinesSignal;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum DriverError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Error, Debug, PartialEq, Clone)]
pub enum AdvanceError {
    #[error(transparent)]
    Reset(#[from] ResetPipelinesSignal),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Result of folding one snapshot transition through all pipelines.
pub struct Advancement {
    pub version: StateVersion,
    pub changes: Vec<(QueryHash, RowChange)>,
    /// Raw diffs of the replicated clients table, carrying per-client
    /// mutation watermarks.
    pub client_rows: Vec<RowDiff>,
}

#[derive(Debug)]
pub struct PipelineDriver {
    snapshotter: Snapshotter,
    /// Ordered by hash so advances fold changes deterministically.
    pipelines: BTreeMap<QueryHash, Pipeline>,
    table_specs: BTreeMap<TableName, TableSpec>,
    /// Cumulative hydration time of the active pipelines; the advance
    /// budget is derived from it.
    hydration_time: Duration,
    circuit_breaker_ratio: f64,
}

impl PipelineDriver {
    /// Opens the snapshotter at the replica's head and validates that the
    /// client schema is a subset of the replicated tables and columns.
    pub fn init(
        replica: Arc<dyn Replica>,
        client_schema: &ClientSchema,
        circuit_breaker_ratio: f64,
    ) -> Result<Self, DriverError> {
        let snapshotter = Snapshotter::init(replica)?;
        let table_specs = snapshotter.current().table_specs();
        client_schema.validate_against(&table_specs)?;
        info!(
            version = %snapshotter.current().state_version(),
            tables = table_specs.len(),
            "initialized pipeline driver"
        );
        Ok(Self {
            snapshotter,
            pipelines: BTreeMap::new(),
            table_specs,
            hydration_time: Duration::ZERO,
            circuit_breaker_ratio,
        })
    }

    pub fn current_version(&self) -> StateVersion {
        self.snapshotter.current().state_version()
    }

    pub fn replica_version(&self) -> StateVersion {
        self.snapshotter.current().replica_version()
    }

    pub fn schema_versions(&self) -> SchemaVersions {
        self.snapshotter.current().schema_versions()
    }

    pub fn table_specs(&self) -> &BTreeMap<TableName, TableSpec> {
        &self.table_specs
    }

    pub fn current_snapshot(&self) -> &Arc<dyn ReplicaSnapshot> {
        self.snapshotter.current()
    }

    pub fn has_query(&self, hash: &QueryHash) -> bool {
        self.pipelines.contains_key(hash)
    }

    pub fn query_hashes(&self) -> Vec<QueryHash> {
        self.pipelines.keys().cloned().collect()
    }

    /// Builds and hydrates the pipeline for `hash`, streaming the current
    /// result set as synthetic adds. Idempotent: a hash that is already
    /// hydrated yields no additional changes.
    #[instrument(skip(self, ast))]
    pub fn add_query(
        &mut self,
        hash: QueryHash,
        ast: &Ast,
    ) -> Result<Vec<RowChange>, DriverError> {
        if self.pipelines.contains_key(&hash) {
            debug!(%hash, "query already hydrated");
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let mut pipeline = Pipeline::new(hash.clone(), ast, &self.table_specs)?;
        let changes = pipeline.hydrate(self.snapshotter.current().as_ref())?;
        let elapsed = started.elapsed();
        self.hydration_time += elapsed;
        debug!(%hash, rows = changes.len(), ?elapsed, "hydrated pipeline");
        self.pipelines.insert(hash, pipeline);
        Ok(changes)
    }

    /// Destroys the pipeline; rows cease being vended for `hash`.
    pub fn remove_query(&mut self, hash: &QueryHash) {
        if self.pipelines.remove(hash).is_some() {
            debug!(%hash, "removed pipeline");
        }
    }

    /// Produces the next snapshot's diff folded through every pipeline.
    #[instrument(skip(self))]
    pub fn advance(&mut self) -> Result<Advancement, AdvanceError> {
        let diff = self
            .snapshotter
            .advance()
            .map_err(DriverError::from)?;
        let total = diff.change_count();
        let budget = self
            .hydration_time
            .mul_f64(self.circuit_breaker_ratio);
        let started = Instant::now();

        let mut changes: Vec<(QueryHash, RowChange)> = Vec::new();
        let mut client_rows = Vec::new();
        for (pos, row_diff) in diff.changes.iter().enumerate() {
            // Progress check in the first half only: if we already burned
            // the budget there, a full re-hydration is cheaper than
            // grinding through the rest.
            if pos <= total / 2
                && !self.hydration_time.is_zero()
                && started.elapsed() > budget
            {
                warn!(pos, total, ?budget, "advance circuit breaker tripped");
                return Err(ResetPipelinesSignal.into());
            }
            if row_diff.table == crate::replica::CLIENTS_TABLE {
                client_rows.push(row_diff.clone());
            }
            for source_change in self.to_source_changes(row_diff)? {
                for pipeline in self.pipelines.values_mut() {
                    if !pipeline.references(&row_diff.table) {
                        continue;
                    }
                    let hash = pipeline.hash().clone();
                    let emitted = pipeline
                        .push(
                            &row_diff.table,
                            &source_change,
                            diff.prev.as_ref(),
                            diff.curr.as_ref(),
                        )
                        .map_err(DriverError::from)?;
                    changes.extend(emitted.into_iter().map(|c| (hash.clone(), c)));
                }
            }
        }

        Ok(Advancement { version: diff.curr.state_version(), changes, client_rows })
    }

    /// Moves to the replica head without diffing; used when no pipeline
    /// depends on row-level changes.
    pub fn advance_without_diff(&mut self) -> Result<StateVersion, DriverError> {
        Ok(self.snapshotter.advance_without_diff()?)
    }

    /// Clears all pipelines and sources; used after upstream schema
    /// changes or a tripped circuit breaker. The caller re-hydrates.
    pub fn reset(&mut self, client_schema: &ClientSchema) -> Result<(), DriverError> {
        self.pipelines.clear();
        self.hydration_time = Duration::ZERO;
        self.snapshotter.advance_without_diff()?;
        self.table_specs = self.snapshotter.current().table_specs();
        client_schema.validate_against(&self.table_specs)?;
        info!(version = %self.current_version(), "reset pipelines");
        Ok(())
    }

    /// Splits a raw diff into source changes: a diff whose union key is
    /// unchanged becomes an `edit`, otherwise a `remove` of the old row
    /// and an `add` of the new one. This keeps the CVR row record stable
    /// across column updates that do not touch the key.
    fn to_source_changes(&self, diff: &RowDiff) -> Result<Vec<SourceChange>, DriverError> {
        let spec = self
            .table_specs
            .get(&diff.table)
            .ok_or_else(|| PipelineError::MissingTable {
                table: diff.table.clone(),
                available: self.table_specs.keys().cloned().collect(),
            })
            .map_err(DriverError::from)?;

        Ok(match (&diff.prev, &diff.next) {
            (None, None) => Vec::new(),
            (None, Some(next)) => vec![SourceChange::Add(next.clone())],
            (Some(prev), None) => vec![SourceChange::Remove(prev.clone())],
            (Some(prev), Some(next)) => {
                let key_stable = spec.union_key_columns().iter().all(|column| {
                    prev.value.get(column) == next.value.get(column)
                });
                if key_stable {
                    vec![SourceChange::Edit { old: prev.clone(), new: next.clone() }]
                } else {
                    vec![
                        SourceChange::Remove(prev.clone()),
                        SourceChange::Add(next.clone()),
                    ]
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::replica::MemReplica;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use zync_core::models::query::query_hash;
    use zync_core::models::row::RowValue;
    use zync_core::models::schema::{ColumnSpec, ValueType};

    fn users_spec() -> TableSpec {
        TableSpec {
            schema: "public".to_string(),
            name: "users".to_string(),
            columns: [
                ("id".to_string(), ColumnSpec { data_type: ValueType::Text, not_null: true }),
                ("login".to_string(), ColumnSpec { data_type: ValueType::Text, not_null: true }),
                ("name".to_string(), ColumnSpec { data_type: ValueType::Text, not_null: false }),
            ]
            .into_iter()
            .collect(),
            primary_key: vec!["id".to_string()],
            unique_indexes: vec![vec!["login".to_string()]],
        }
    }

    fn replica() -> Arc<MemReplica> {
        let replica = MemReplica::new(SchemaVersions {
            min_supported_version: 1,
            max_supported_version: 1,
        });
        replica.create_table(users_spec());
        Arc::new(replica)
    }

    fn row(v: serde_json::Value) -> RowValue {
        v.as_object().unwrap().clone()
    }

    fn driver(replica: Arc<MemReplica>) -> PipelineDriver {
        PipelineDriver::init(replica, &ClientSchema::default(), 0.5).unwrap()
    }

    #[test]
    fn test_init_rejects_unknown_client_schema() {
        let mut schema = ClientSchema::default();
        schema
            .tables
            .insert("missing".to_string(), Default::default());
        let err = PipelineDriver::init(replica(), &schema, 0.5).unwrap_err();
        assert!(matches!(err, DriverError::Schema(SchemaError::UnknownTable(t, _)) if t == "missing"));
    }

    #[test]
    fn test_add_query_is_idempotent() {
        let replica = replica();
        replica
            .write()
            .upsert("users", row(json!({"id": "u1", "login": "alice", "name": "Alice"})))
            .commit()
            .unwrap();
        let mut driver = driver(replica);

        let ast = Ast::table("users");
        let hash = query_hash(&ast);
        let first = driver.add_query(hash.clone(), &ast).unwrap();
        assert_eq!(first.len(), 1);
        let second = driver.add_query(hash, &ast).unwrap();
        assert_eq!(second, vec![]);
    }

    #[test]
    fn test_advance_emits_tagged_changes() {
        let replica = replica();
        let mut driver = driver(replica.clone());
        let ast = Ast::table("users");
        let hash = query_hash(&ast);
        driver.add_query(hash.clone(), &ast).unwrap();

        replica
            .write()
            .upsert("users", row(json!({"id": "u1", "login": "alice", "name": "Alice"})))
            .commit()
            .unwrap();
        let advancement = driver.advance().unwrap();
        assert_eq!(advancement.version, replica.head());
        assert_eq!(advancement.changes.len(), 1);
        assert_eq!(advancement.changes[0].0, hash);
        assert!(matches!(&advancement.changes[0].1, RowChange::Add { .. }));
    }

    #[test]
    fn test_union_key_stability_distinguishes_edit_from_remove_add() {
        let replica = replica();
        let mut driver = driver(replica.clone());
        let ast = Ast::table("users");
        let hash = query_hash(&ast);
        replica
            .write()
            .upsert("users", row(json!({"id": "u1", "login": "alice", "name": "Alice"})))
            .commit()
            .unwrap();
        driver.advance_without_diff().unwrap();
        driver.add_query(hash.clone(), &ast).unwrap();

        // Name change: the union key (id, login) is untouched -> edit.
        replica
            .write()
            .upsert("users", row(json!({"id": "u1", "login": "alice", "name": "Alicia"})))
            .commit()
            .unwrap();
        let advancement = driver.advance().unwrap();
        assert_eq!(advancement.changes.len(), 1);
        assert!(matches!(&advancement.changes[0].1, RowChange::Edit { .. }));

        // Login change: part of the union key -> remove + add.
        replica
            .write()
            .upsert("users", row(json!({"id": "u1", "login": "alice2", "name": "Alicia"})))
            .commit()
            .unwrap();
        let advancement = driver.advance().unwrap();
        let kinds: Vec<&str> = advancement
            .changes
            .iter()
            .map(|(_, c)| match c {
                RowChange::Add { .. } => "add",
                RowChange::Remove { .. } => "remove",
                RowChange::Edit { .. } => "edit",
                RowChange::Child { .. } => "child",
            })
            .collect();
        assert_eq!(kinds, vec!["remove", "add"]);
    }

    #[test]
    fn test_remove_query_stops_vending() {
        let replica = replica();
        let mut driver = driver(replica.clone());
        let ast = Ast::table("users");
        let hash = query_hash(&ast);
        driver.add_query(hash.clone(), &ast).unwrap();
        driver.remove_query(&hash);

        replica
            .write()
            .upsert("users", row(json!({"id": "u1", "login": "alice", "name": "Alice"})))
            .commit()
            .unwrap();
        let advancement = driver.advance().unwrap();
        assert_eq!(advancement.changes, vec![]);
    }

    #[test]
    fn test_reset_clears_pipelines_and_moves_to_head() {
        let replica = replica();
        let mut driver = driver(replica.clone());
        let ast = Ast::table("users");
        let hash = query_hash(&ast);
        driver.add_query(hash.clone(), &ast).unwrap();

        replica
            .write()
            .upsert("users", row(json!({"id": "u1", "login": "alice", "name": "Alice"})))
            .commit()
            .unwrap();
        driver.reset(&ClientSchema::default()).unwrap();
        assert!(!driver.has_query(&hash));
        assert_eq!(driver.current_version(), replica.head());

        // Re-hydration after the reset sees the full current state.
        let changes = driver.add_query(hash, &ast).unwrap();
        assert_eq!(changes.len(), 1);
    }
}
