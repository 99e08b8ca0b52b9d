//! Incremental view maintenance.
//!
//! A pipeline materializes one query's result set over a replica snapshot
//! and turns source-level row diffs into a stream of result-level
//! changes. Changes to relationship rows are emitted as `child` changes
//! immediately after (or on behalf of) their parent, preserving
//! referential correctness during fan-out.

use crate::replica::ReplicaRow;
use thiserror::Error;
use zync_core::TableName;

pub mod expr;
pub mod pipeline;

pub use pipeline::Pipeline;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum PipelineError {
    #[error("query references missing table `{table}`; available tables: {available:?}")]
    MissingTable { table: TableName, available: Vec<TableName> },
    #[error("malformed query: {0}")]
    Malformed(String),
    #[error("replica error: {0}")]
    Replica(#[from] crate::replica::ReplicaError),
}

/// A change to a source table, as fed into pipelines. The edit/remove+add
/// decision on key changes has already been made by the driver.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceChange {
    Add(ReplicaRow),
    Remove(ReplicaRow),
    Edit { old: ReplicaRow, new: ReplicaRow },
}

/// A change to a query's result set.
#[derive(Clone, Debug, PartialEq)]
pub enum RowChange {
    Add { table: TableName, row: ReplicaRow },
    Edit { table: TableName, old: ReplicaRow, row: ReplicaRow },
    Remove { table: TableName, row: ReplicaRow },
    /// A change to a nested relationship row.
    Child { change: Box<RowChange> },
}

impl RowChange {
    pub fn child(change: RowChange) -> Self {
        RowChange::Child { change: Box::new(change) }
    }

    /// The change with `child` nesting stripped.
    pub fn flatten(&self) -> &RowChange {
        match self {
            RowChange::Child { change } => change.flatten(),
            other => other,
        }
    }

    pub fn table(&self) -> &TableName {
        match self.flatten() {
            RowChange::Add { table, .. }
            | RowChange::Edit { table, .. }
            | RowChange::Remove { table, .. } => table,
            RowChange::Child { .. } => unreachable!("flatten strips child nesting"),
        }
    }
}
