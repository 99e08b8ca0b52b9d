//! One query's dataflow.
//!
//! A pipeline keeps the full set of rows matching its root query in sort
//! order and derives result changes from source-level diffs:
//!
//! * root-table changes update the materialized set incrementally,
//!   including limit-window entry/exit;
//! * changes to tables referenced by `exists` subqueries recompute the
//!   root membership against the new snapshot and diff it against the
//!   materialized state;
//! * changes to relationship tables re-derive the affected parents' child
//!   subtrees from the previous and current snapshots and diff them.
//!
//! Rows of `permissions`-system subqueries participate in filtering only
//! and are never emitted.

use super::{PipelineError, RowChange, SourceChange};
use crate::ivm::expr::{eval_condition, SortKey};
use crate::replica::{ReplicaRow, ReplicaSnapshot};
use std::collections::{BTreeMap, BTreeSet};
use zync_core::models::query::{
    Ast, Condition, Correlation, CorrelatedSubquery, OrderPart, QuerySystem,
};
use zync_core::models::row::RowValue;
use zync_core::models::schema::TableSpec;
use zync_core::models::version::StateVersion;
use zync_core::{QueryHash, TableName};

use crate::ivm::expr::cmp_values;
use std::cmp::Ordering;

struct RelatedNode {
    correlation: Correlation,
    system: QuerySystem,
    node: QueryNode,
}

struct QueryNode {
    table: TableName,
    filter: Option<Condition>,
    related: Vec<RelatedNode>,
    order_by: Vec<OrderPart>,
    limit: Option<usize>,
}

impl QueryNode {
    fn compile(ast: &Ast) -> Self {
        Self {
            table: ast.table.clone(),
            filter: ast.where_.clone(),
            related: ast
                .related
                .iter()
                .map(|r| RelatedNode {
                    correlation: r.correlation.clone(),
                    system: r.system,
                    node: QueryNode::compile(&r.subquery),
                })
                .collect(),
            order_by: ast.order_by.clone(),
            limit: ast.limit.map(|l| l as usize),
        }
    }
}

fn collect_exists_tables(condition: &Condition, into: &mut BTreeSet<TableName>) {
    match condition {
        Condition::Correlated { related, .. } => {
            for table in related.subquery.referenced_tables() {
                into.insert(table);
            }
        }
        Condition::And { conditions } | Condition::Or { conditions } => {
            for cond in conditions {
                collect_exists_tables(cond, into);
            }
        }
        _ => {}
    }
}

fn collect_related_tables(node: &QueryNode, into: &mut BTreeSet<TableName>, root: bool) {
    if !root {
        into.insert(node.table.clone());
        if let Some(filter) = &node.filter {
            collect_exists_tables(filter, into);
        }
    }
    for rel in &node.related {
        if rel.system == QuerySystem::Permissions {
            continue;
        }
        collect_related_tables(&rel.node, into, false);
    }
}

#[derive(Debug)]
pub struct Pipeline {
    hash: QueryHash,
    specs: BTreeMap<TableName, TableSpec>,
    root: QueryNode,
    /// All rows matching the root query (filter and exists applied),
    /// beyond the limit window too.
    rows: BTreeMap<SortKey, ReplicaRow>,
    /// Tables whose changes can move root membership via `exists`.
    exists_tables: BTreeSet<TableName>,
    /// Tables contributing relationship child rows.
    related_tables: BTreeSet<TableName>,
    hydrated_at: Option<StateVersion>,
}

impl Pipeline {
    /// Compiles a bound, auth-transformed AST. Fails when the query
    /// references tables the replica does not have.
    pub fn new(
        hash: QueryHash,
        ast: &Ast,
        specs: &BTreeMap<TableName, TableSpec>,
    ) -> Result<Self, PipelineError> {
        for table in ast.referenced_tables() {
            if !specs.contains_key(&table) {
                return Err(PipelineError::MissingTable {
                    table,
                    available: specs.keys().cloned().collect(),
                });
            }
        }
        let root = QueryNode::compile(ast);
        let mut exists_tables = BTreeSet::new();
        if let Some(filter) = &root.filter {
            collect_exists_tables(filter, &mut exists_tables);
        }
        let mut related_tables = BTreeSet::new();
        collect_related_tables(&root, &mut related_tables, true);

        Ok(Self {
            hash,
            specs: specs.clone(),
            root,
            rows: BTreeMap::new(),
            exists_tables,
            related_tables,
            hydrated_at: None,
        })
    }

    pub fn hash(&self) -> &QueryHash {
        &self.hash
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated_at.is_some()
    }

    /// Whether a change to `table` can affect this pipeline's output.
    pub fn references(&self, table: &TableName) -> bool {
        *table == self.root.table
            || self.exists_tables.contains(table)
            || self.related_tables.contains(table)
    }

    fn pk_canonical(&self, table: &TableName, value: &RowValue) -> Result<String, PipelineError> {
        let spec = self
            .specs
            .get(table)
            .ok_or_else(|| PipelineError::MissingTable {
                table: table.clone(),
                available: self.specs.keys().cloned().collect(),
            })?;
        let mut key = String::new();
        for column in &spec.primary_key {
            let v = value.get(column).cloned().unwrap_or(serde_json::Value::Null);
            key.push_str(&format!("{column}={v}\u{0}"));
        }
        Ok(key)
    }

    fn sort_key(&self, node: &QueryNode, row: &RowValue) -> Result<SortKey, PipelineError> {
        let tiebreak = self.pk_canonical(&node.table, row)?;
        Ok(SortKey::new(row, &node.order_by, tiebreak))
    }

    fn eval_exists(
        &self,
        sub: &CorrelatedSubquery,
        parent: &RowValue,
        snap: &dyn ReplicaSnapshot,
    ) -> bool {
        let Ok(rows) = snap.rows(&sub.subquery.table) else {
            return false;
        };
        rows.iter().any(|child| {
            correlation_matches(&sub.correlation, parent, &child.value)
                && match &sub.subquery.where_ {
                    None => true,
                    Some(cond) => eval_condition(cond, &child.value, &mut |s, r| {
                        self.eval_exists(s, r, snap)
                    }),
                }
        })
    }

    fn matches(&self, node: &QueryNode, row: &RowValue, snap: &dyn ReplicaSnapshot) -> bool {
        match &node.filter {
            None => true,
            Some(cond) => {
                eval_condition(cond, row, &mut |s, r| self.eval_exists(s, r, snap))
            }
        }
    }

    /// Children of one relationship for one parent, ordered and limited.
    fn query_children(
        &self,
        rel: &RelatedNode,
        parent: &RowValue,
        snap: &dyn ReplicaSnapshot,
    ) -> Result<Vec<ReplicaRow>, PipelineError> {
        let mut children: BTreeMap<SortKey, ReplicaRow> = BTreeMap::new();
        for child in snap.rows(&rel.node.table)? {
            if correlation_matches(&rel.correlation, parent, &child.value)
                && self.matches(&rel.node, &child.value, snap)
            {
                children.insert(self.sort_key(&rel.node, &child.value)?, child);
            }
        }
        let limit = rel.node.limit.unwrap_or(usize::MAX);
        Ok(children.into_values().take(limit).collect())
    }

    /// Flattened (table, row) fan-out of all relationship subtrees of one
    /// parent, in deterministic order.
    fn subtree_rows(
        &self,
        related: &[RelatedNode],
        parent: &RowValue,
        snap: &dyn ReplicaSnapshot,
    ) -> Result<Vec<(TableName, ReplicaRow)>, PipelineError> {
        let mut out = Vec::new();
        for rel in related {
            if rel.system == QuerySystem::Permissions {
                continue;
            }
            for child in self.query_children(rel, parent, snap)? {
                out.push((rel.node.table.clone(), child.clone()));
                out.extend(self.subtree_rows(&rel.node.related, &child.value, snap)?);
            }
        }
        Ok(out)
    }

    fn window(&self) -> Vec<(SortKey, ReplicaRow)> {
        let limit = self.root.limit.unwrap_or(usize::MAX);
        self.rows
            .iter()
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Streams the current result set as synthetic adds.
    pub fn hydrate(
        &mut self,
        snap: &dyn ReplicaSnapshot,
    ) -> Result<Vec<RowChange>, PipelineError> {
        self.rows.clear();
        for row in snap.rows(&self.root.table)? {
            if self.matches(&self.root, &row.value, snap) {
                self.rows
                    .insert(self.sort_key(&self.root, &row.value)?, row);
            }
        }

        let mut changes = Vec::new();
        for (_, row) in self.window() {
            changes.push(RowChange::Add { table: self.root.table.clone(), row: row.clone() });
            for (table, child) in self.subtree_rows(&self.root.related, &row.value, snap)? {
                changes.push(RowChange::child(RowChange::Add { table, row: child }));
            }
        }
        self.hydrated_at = Some(snap.state_version());
        Ok(changes)
    }

    /// Feeds one source change through the pipeline.
    pub fn push(
        &mut self,
        table: &TableName,
        change: &SourceChange,
        prev: &dyn ReplicaSnapshot,
        curr: &dyn ReplicaSnapshot,
    ) -> Result<Vec<RowChange>, PipelineError> {
        let mut out = Vec::new();
        // Parents added or removed by an earlier phase of this push;
        // the related phase must not re-derive their subtrees.
        let mut touched = BTreeSet::new();

        if *table == self.root.table {
            self.push_root(change, prev, curr, &mut out, &mut touched)?;
        }
        if self.exists_tables.contains(table) {
            self.recompute_root(prev, curr, &mut out, &mut touched)?;
        }
        if self.related_tables.contains(table) {
            self.push_related(prev, curr, &mut out, &touched)?;
        }
        self.hydrated_at = Some(curr.state_version());
        Ok(out)
    }

    fn push_root(
        &mut self,
        change: &SourceChange,
        prev: &dyn ReplicaSnapshot,
        curr: &dyn ReplicaSnapshot,
        out: &mut Vec<RowChange>,
        touched: &mut BTreeSet<String>,
    ) -> Result<(), PipelineError> {
        let (old, new) = match change {
            SourceChange::Add(row) => (None, Some(row)),
            SourceChange::Remove(row) => (Some(row), None),
            SourceChange::Edit { old, new } => (Some(old), Some(new)),
        };

        let pk = self.pk_canonical(
            &self.root.table,
            &old.or(new).expect("source changes carry a row").value,
        )?;
        let old_entry = self.entry_by_pk(&pk);
        let new_matches = match new {
            Some(row) => self.matches(&self.root, &row.value, curr),
            None => false,
        };

        let old_window = self.window();

        // Mutate the materialized set.
        if let Some((key, _)) = &old_entry {
            self.rows.remove(key);
        }
        if let Some(row) = new {
            if new_matches {
                self.rows
                    .insert(self.sort_key(&self.root, &row.value)?, row.clone());
            }
        }

        let new_window = self.window();
        self.diff_windows(&old_window, &new_window, prev, curr, out, touched)
    }

    /// Recomputes root membership from the current snapshot; used when a
    /// table referenced through `exists` changed.
    fn recompute_root(
        &mut self,
        prev: &dyn ReplicaSnapshot,
        curr: &dyn ReplicaSnapshot,
        out: &mut Vec<RowChange>,
        touched: &mut BTreeSet<String>,
    ) -> Result<(), PipelineError> {
        let mut recomputed: BTreeMap<SortKey, ReplicaRow> = BTreeMap::new();
        for row in curr.rows(&self.root.table)? {
            if self.matches(&self.root, &row.value, curr) {
                recomputed.insert(self.sort_key(&self.root, &row.value)?, row);
            }
        }

        let old_window = self.window();
        self.rows = recomputed;
        let new_window = self.window();
        self.diff_windows(&old_window, &new_window, prev, curr, out, touched)
    }

    /// Emits the delta between two limit windows, with child fan-out.
    /// Removed rows resolve their subtrees against the previous snapshot,
    /// added rows against the current one.
    fn diff_windows(
        &self,
        old_window: &[(SortKey, ReplicaRow)],
        new_window: &[(SortKey, ReplicaRow)],
        prev: &dyn ReplicaSnapshot,
        curr: &dyn ReplicaSnapshot,
        out: &mut Vec<RowChange>,
        touched: &mut BTreeSet<String>,
    ) -> Result<(), PipelineError> {
        let old_by_pk: BTreeMap<&str, &ReplicaRow> = old_window
            .iter()
            .map(|(k, v)| (k.tiebreak(), v))
            .collect();
        let new_by_pk: BTreeMap<&str, &ReplicaRow> = new_window
            .iter()
            .map(|(k, v)| (k.tiebreak(), v))
            .collect();

        for (pk, old_row) in &old_by_pk {
            if !new_by_pk.contains_key(pk) {
                touched.insert(pk.to_string());
                out.push(RowChange::Remove {
                    table: self.root.table.clone(),
                    row: (*old_row).clone(),
                });
                for (table, child) in
                    self.subtree_rows(&self.root.related, &old_row.value, prev)?
                {
                    out.push(RowChange::child(RowChange::Remove { table, row: child }));
                }
            }
        }
        for (pk, new_row) in &new_by_pk {
            match old_by_pk.get(pk) {
                None => {
                    touched.insert(pk.to_string());
                    out.push(RowChange::Add {
                        table: self.root.table.clone(),
                        row: (*new_row).clone(),
                    });
                    for (table, child) in
                        self.subtree_rows(&self.root.related, &new_row.value, curr)?
                    {
                        out.push(RowChange::child(RowChange::Add { table, row: child }));
                    }
                }
                Some(old_row) if *old_row != *new_row => {
                    touched.insert(pk.to_string());
                    out.push(RowChange::Edit {
                        table: self.root.table.clone(),
                        old: (*old_row).clone(),
                        row: (*new_row).clone(),
                    });
                    let old_subtree =
                        self.subtree_rows(&self.root.related, &old_row.value, prev)?;
                    let new_subtree =
                        self.subtree_rows(&self.root.related, &new_row.value, curr)?;
                    self.diff_subtrees(old_subtree, new_subtree, out)?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Re-derives the child subtrees of parents that stayed in the window
    /// and emits the difference; used when a relationship table changed.
    fn push_related(
        &self,
        prev: &dyn ReplicaSnapshot,
        curr: &dyn ReplicaSnapshot,
        out: &mut Vec<RowChange>,
        touched: &BTreeSet<String>,
    ) -> Result<(), PipelineError> {
        for (key, parent) in self.window() {
            if touched.contains(key.tiebreak()) {
                continue;
            }
            let old_subtree = self.subtree_rows(&self.root.related, &parent.value, prev)?;
            let new_subtree = self.subtree_rows(&self.root.related, &parent.value, curr)?;
            self.diff_subtrees(old_subtree, new_subtree, out)?;
        }
        Ok(())
    }

    fn diff_subtrees(
        &self,
        old: Vec<(TableName, ReplicaRow)>,
        new: Vec<(TableName, ReplicaRow)>,
        out: &mut Vec<RowChange>,
    ) -> Result<(), PipelineError> {
        // Multiset match by (table, primary key): the same child row may
        // legitimately appear under several relationship branches.
        let mut remaining: BTreeMap<(TableName, String), Vec<ReplicaRow>> = BTreeMap::new();
        for (table, row) in old {
            let pk = self.pk_canonical(&table, &row.value)?;
            remaining.entry((table, pk)).or_default().push(row);
        }
        for (table, row) in new {
            let pk = self.pk_canonical(&table, &row.value)?;
            match remaining
                .get_mut(&(table.clone(), pk.clone()))
                .and_then(Vec::pop)
            {
                Some(old_row) if old_row == row => {}
                Some(old_row) => out.push(RowChange::child(RowChange::Edit {
                    table,
                    old: old_row,
                    row,
                })),
                None => out.push(RowChange::child(RowChange::Add { table, row })),
            }
        }
        for ((table, _), rows) in remaining {
            for row in rows {
                out.push(RowChange::child(RowChange::Remove { table: table.clone(), row }));
            }
        }
        Ok(())
    }

    fn entry_by_pk(&self, pk: &str) -> Option<(SortKey, ReplicaRow)> {
        self.rows
            .iter()
            .find(|(k, _)| k.tiebreak() == pk)
            .map(|(k, v)| (k.clone(), v.clone()))
    }
}

fn correlation_matches(correlation: &Correlation, parent: &RowValue, child: &RowValue) -> bool {
    if correlation.parent_field.len() != correlation.child_field.len() {
        return false;
    }
    correlation
        .parent_field
        .iter()
        .zip(correlation.child_field.iter())
        .all(|(p, c)| {
            let pv = parent.get(p).cloned().unwrap_or(serde_json::Value::Null);
            let cv = child.get(c).cloned().unwrap_or(serde_json::Value::Null);
            // NULLs never join.
            !pv.is_null() && cmp_values(&pv, &cv) == Ordering::Equal
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::replica::{MemReplica, Replica};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use zync_core::models::query::{
        query_hash, ExistsOp, SimpleCondition, SimpleOperator, SortDirection, ValuePosition,
    };
    use zync_core::models::schema::{ColumnSpec, SchemaVersions, ValueType};

    fn spec(name: &str, columns: &[&str]) -> TableSpec {
        TableSpec {
            schema: "public".to_string(),
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|c| {
                    (c.to_string(), ColumnSpec { data_type: ValueType::Text, not_null: false })
                })
                .collect(),
            primary_key: vec!["id".to_string()],
            unique_indexes: vec![],
        }
    }

    fn replica() -> MemReplica {
        let replica = MemReplica::new(SchemaVersions {
            min_supported_version: 1,
            max_supported_version: 1,
        });
        replica.create_table(spec("issues", &["id", "project_id", "rank"]));
        replica.create_table(spec("comments", &["id", "issue_id", "body"]));
        replica.create_table(spec("project_members", &["id", "project_id", "user_id"]));
        replica
    }

    fn row(v: serde_json::Value) -> RowValue {
        v.as_object().unwrap().clone()
    }

    fn issues_ast() -> Ast {
        Ast {
            where_: Some(Condition::Simple(SimpleCondition {
                op: SimpleOperator::Eq,
                left: ValuePosition::column("project_id"),
                right: ValuePosition::literal("p1"),
            })),
            order_by: vec![OrderPart("rank".to_string(), SortDirection::Asc)],
            ..Ast::table("issues")
        }
    }

    fn pipeline_for(replica: &MemReplica, ast: &Ast) -> Pipeline {
        let snap = replica.snapshot().unwrap();
        Pipeline::new(query_hash(ast), ast, &snap.table_specs()).unwrap()
    }

    fn tables_of(changes: &[RowChange]) -> Vec<(&str, String, &str)> {
        changes
            .iter()
            .map(|c| {
                let kind = match c {
                    RowChange::Child { .. } => "child",
                    RowChange::Add { .. } => "add",
                    RowChange::Edit { .. } => "edit",
                    RowChange::Remove { .. } => "remove",
                };
                let inner = match c.flatten() {
                    RowChange::Add { row, .. } => ("add", row.value["id"].to_string()),
                    RowChange::Edit { row, .. } => ("edit", row.value["id"].to_string()),
                    RowChange::Remove { row, .. } => ("remove", row.value["id"].to_string()),
                    RowChange::Child { .. } => unreachable!(),
                };
                (inner.0, inner.1, kind)
            })
            .collect()
    }

    #[test]
    fn test_missing_table_lists_available() {
        let replica = replica();
        let snap = replica.snapshot().unwrap();
        let ast = Ast::table("missing");
        let err = Pipeline::new(query_hash(&ast), &ast, &snap.table_specs()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingTable { table, available }
                if table == "missing" && available.contains(&"issues".to_string())
        ));
    }

    #[test]
    fn test_hydrate_then_filtered_pushes() {
        let replica = replica();
        replica
            .write()
            .upsert("issues", row(json!({"id": "i1", "project_id": "p1", "rank": 1})))
            .upsert("issues", row(json!({"id": "i2", "project_id": "p2", "rank": 2})))
            .commit()
            .unwrap();

        let mut pipeline = pipeline_for(&replica, &issues_ast());
        let prev = replica.snapshot().unwrap();
        let changes = pipeline.hydrate(prev.as_ref()).unwrap();
        assert_eq!(tables_of(&changes), vec![("add", "\"i1\"".to_string(), "add")]);

        // A row of another project is filtered out.
        replica
            .write()
            .upsert("issues", row(json!({"id": "i3", "project_id": "p2", "rank": 3})))
            .commit()
            .unwrap();
        let curr = replica.snapshot().unwrap();
        let changes = pipeline
            .push(
                &"issues".to_string(),
                &SourceChange::Add(ReplicaRow {
                    value: row(json!({"id": "i3", "project_id": "p2", "rank": 3})),
                    version: "x".to_string(),
                }),
                prev.as_ref(),
                curr.as_ref(),
            )
            .unwrap();
        assert_eq!(changes, vec![]);
    }

    #[test]
    fn test_edit_keeps_identity() {
        let replica = replica();
        replica
            .write()
            .upsert("issues", row(json!({"id": "i1", "project_id": "p1", "rank": 1})))
            .commit()
            .unwrap();
        let mut pipeline = pipeline_for(&replica, &issues_ast());
        let prev = replica.snapshot().unwrap();
        pipeline.hydrate(prev.as_ref()).unwrap();

        let old = prev.rows(&"issues".to_string()).unwrap()[0].clone();
        replica
            .write()
            .upsert("issues", row(json!({"id": "i1", "project_id": "p1", "rank": 5})))
            .commit()
            .unwrap();
        let curr = replica.snapshot().unwrap();
        let new = curr.rows(&"issues".to_string()).unwrap()[0].clone();

        let changes = pipeline
            .push(
                &"issues".to_string(),
                &SourceChange::Edit { old, new },
                prev.as_ref(),
                curr.as_ref(),
            )
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], RowChange::Edit { row, .. } if row.value["rank"] == json!(5)));
    }

    #[test]
    fn test_limit_window_shifts() {
        let replica = replica();
        replica
            .write()
            .upsert("issues", row(json!({"id": "i1", "project_id": "p1", "rank": 1})))
            .upsert("issues", row(json!({"id": "i2", "project_id": "p1", "rank": 2})))
            .upsert("issues", row(json!({"id": "i3", "project_id": "p1", "rank": 3})))
            .commit()
            .unwrap();

        let ast = Ast { limit: Some(2), ..issues_ast() };
        let mut pipeline = pipeline_for(&replica, &ast);
        let prev = replica.snapshot().unwrap();
        let changes = pipeline.hydrate(prev.as_ref()).unwrap();
        assert_eq!(
            tables_of(&changes)
                .iter()
                .map(|c| c.1.as_str())
                .collect::<Vec<_>>(),
            vec!["\"i1\"", "\"i2\""]
        );

        // A new head row pushes i2 out of the window.
        replica
            .write()
            .upsert("issues", row(json!({"id": "i0", "project_id": "p1", "rank": 0})))
            .commit()
            .unwrap();
        let curr = replica.snapshot().unwrap();
        let changes = pipeline
            .push(
                &"issues".to_string(),
                &SourceChange::Add(ReplicaRow {
                    value: row(json!({"id": "i0", "project_id": "p1", "rank": 0})),
                    version: curr.rows(&"issues".to_string()).unwrap()[0].version.clone(),
                }),
                prev.as_ref(),
                curr.as_ref(),
            )
            .unwrap();
        let summary = tables_of(&changes);
        assert!(summary.contains(&("remove", "\"i2\"".to_string(), "remove")));
        assert!(summary.contains(&("add", "\"i0\"".to_string(), "add")));

        // Removing a window row pulls i2 back in.
        let prev = curr;
        replica
            .write()
            .delete("issues", row(json!({"id": "i0"})))
            .commit()
            .unwrap();
        let curr = replica.snapshot().unwrap();
        let changes = pipeline
            .push(
                &"issues".to_string(),
                &SourceChange::Remove(ReplicaRow {
                    value: row(json!({"id": "i0", "project_id": "p1", "rank": 0})),
                    version: "x".to_string(),
                }),
                prev.as_ref(),
                curr.as_ref(),
            )
            .unwrap();
        let summary = tables_of(&changes);
        assert!(summary.contains(&("remove", "\"i0\"".to_string(), "remove")));
        assert!(summary.contains(&("add", "\"i2\"".to_string(), "add")));
    }

    fn issues_with_comments() -> Ast {
        Ast {
            related: vec![CorrelatedSubquery {
                correlation: Correlation {
                    parent_field: vec!["id".to_string()],
                    child_field: vec!["issue_id".to_string()],
                },
                subquery: Box::new(Ast::table("comments")),
                system: QuerySystem::Client,
            }],
            ..issues_ast()
        }
    }

    #[test]
    fn test_related_children_fan_out_as_child_changes() {
        let replica = replica();
        replica
            .write()
            .upsert("issues", row(json!({"id": "i1", "project_id": "p1", "rank": 1})))
            .upsert("comments", row(json!({"id": "c1", "issue_id": "i1", "body": "hi"})))
            .commit()
            .unwrap();

        let mut pipeline = pipeline_for(&replica, &issues_with_comments());
        let prev = replica.snapshot().unwrap();
        let changes = pipeline.hydrate(prev.as_ref()).unwrap();
        assert_eq!(
            tables_of(&changes),
            vec![
                ("add", "\"i1\"".to_string(), "add"),
                ("add", "\"c1\"".to_string(), "child"),
            ]
        );

        // A new comment arrives as a nested child add.
        replica
            .write()
            .upsert("comments", row(json!({"id": "c2", "issue_id": "i1", "body": "yo"})))
            .commit()
            .unwrap();
        let curr = replica.snapshot().unwrap();
        let changes = pipeline
            .push(
                &"comments".to_string(),
                &SourceChange::Add(ReplicaRow {
                    value: row(json!({"id": "c2", "issue_id": "i1", "body": "yo"})),
                    version: "x".to_string(),
                }),
                prev.as_ref(),
                curr.as_ref(),
            )
            .unwrap();
        assert_eq!(tables_of(&changes), vec![("add", "\"c2\"".to_string(), "child")]);

        // A comment of an unrelated issue changes nothing.
        let prev = curr;
        replica
            .write()
            .upsert("comments", row(json!({"id": "c9", "issue_id": "i9", "body": "na"})))
            .commit()
            .unwrap();
        let curr = replica.snapshot().unwrap();
        let changes = pipeline
            .push(
                &"comments".to_string(),
                &SourceChange::Add(ReplicaRow {
                    value: row(json!({"id": "c9", "issue_id": "i9", "body": "na"})),
                    version: "x".to_string(),
                }),
                prev.as_ref(),
                curr.as_ref(),
            )
            .unwrap();
        assert_eq!(changes, vec![]);
    }

    fn issues_where_member(user: &str) -> Ast {
        // issues of p1, visible only while `user` is a member of the
        // project; the membership subquery is a permissions pipeline.
        let mut ast = issues_ast();
        ast.where_ = Some(Condition::and(vec![
            ast.where_.take().unwrap(),
            Condition::Correlated {
                related: CorrelatedSubquery {
                    correlation: Correlation {
                        parent_field: vec!["project_id".to_string()],
                        child_field: vec!["project_id".to_string()],
                    },
                    subquery: Box::new(Ast {
                        where_: Some(Condition::Simple(SimpleCondition {
                            op: SimpleOperator::Eq,
                            left: ValuePosition::column("user_id"),
                            right: ValuePosition::literal(user),
                        })),
                        ..Ast::table("project_members")
                    }),
                    system: QuerySystem::Permissions,
                },
                op: ExistsOp::Exists,
            },
        ]));
        ast
    }

    #[test]
    fn test_exists_gates_membership_and_never_vends_its_rows() {
        let replica = replica();
        replica
            .write()
            .upsert("issues", row(json!({"id": "i1", "project_id": "p1", "rank": 1})))
            .commit()
            .unwrap();

        let mut pipeline = pipeline_for(&replica, &issues_where_member("u2"));
        let prev = replica.snapshot().unwrap();
        // u2 is not a member: the result is empty.
        assert_eq!(pipeline.hydrate(prev.as_ref()).unwrap(), vec![]);

        // Membership arrives: the issue appears, but no project_members
        // row is ever emitted.
        replica
            .write()
            .upsert(
                "project_members",
                row(json!({"id": "m1", "project_id": "p1", "user_id": "u2"})),
            )
            .commit()
            .unwrap();
        let curr = replica.snapshot().unwrap();
        let changes = pipeline
            .push(
                &"project_members".to_string(),
                &SourceChange::Add(ReplicaRow {
                    value: row(json!({"id": "m1", "project_id": "p1", "user_id": "u2"})),
                    version: "x".to_string(),
                }),
                prev.as_ref(),
                curr.as_ref(),
            )
            .unwrap();
        assert_eq!(tables_of(&changes), vec![("add", "\"i1\"".to_string(), "add")]);

        // Membership revoked: the issue disappears again.
        let prev = curr;
        replica
            .write()
            .delete("project_members", row(json!({"id": "m1"})))
            .commit()
            .unwrap();
        let curr = replica.snapshot().unwrap();
        let changes = pipeline
            .push(
                &"project_members".to_string(),
                &SourceChange::Remove(ReplicaRow {
                    value: row(json!({"id": "m1", "project_id": "p1", "user_id": "u2"})),
                    version: "x".to_string(),
                }),
                prev.as_ref(),
                curr.as_ref(),
            )
            .unwrap();
        assert_eq!(tables_of(&changes), vec![("remove", "\"i1\"".to_string(), "remove")]);
    }

    #[test]
    fn test_push_is_idempotent_for_replayed_adds() {
        let replica = replica();
        replica
            .write()
            .upsert("issues", row(json!({"id": "i1", "project_id": "p1", "rank": 1})))
            .commit()
            .unwrap();
        let mut pipeline = pipeline_for(&replica, &issues_ast());
        let snap = replica.snapshot().unwrap();
        pipeline.hydrate(snap.as_ref()).unwrap();

        let added = snap.rows(&"issues".to_string()).unwrap()[0].clone();
        let changes = pipeline
            .push(
                &"issues".to_string(),
                &SourceChange::Add(added),
                snap.as_ref(),
                snap.as_ref(),
            )
            .unwrap();
        assert_eq!(changes, vec![]);
    }
}
