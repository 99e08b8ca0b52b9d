//! Row-key schema evolution within a live CVR.
//!
//! After a schema change introduces a new unique key, pipelines emit rows
//! keyed by the new union key while the CVR still holds records under the
//! old one. `KeyColumns` precomputes the key column sets present in the
//! CVR per table and reconstructs the old row id from a new row so
//! tombstones and updates land on the existing record. A column missing
//! from the row means the CVR is stale versus the replica and must be
//! invalidated.

use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use zync_core::models::row::{RowId, RowKey, RowRecord, RowValue};
use zync_core::{ColumnName, SchemaName, TableName};

#[derive(Error, Debug, PartialEq, Clone)]
pub enum KeyColumnsError {
    #[error(
        "client view references key column `{column}` of `{table}` which the replica no longer has"
    )]
    StaleClientView { table: TableName, column: ColumnName },
    #[error("failed to build row key: {0}")]
    Key(String),
}

pub struct KeyColumns {
    /// Distinct key column sets per (schema, table) observed in the CVR.
    per_table: HashMap<(SchemaName, TableName), Vec<BTreeSet<ColumnName>>>,
}

impl KeyColumns {
    pub fn new<'a>(records: impl IntoIterator<Item = &'a RowRecord>) -> Self {
        let mut per_table: HashMap<(SchemaName, TableName), Vec<BTreeSet<ColumnName>>> =
            HashMap::new();
        for record in records {
            let key = (record.id.schema.clone(), record.id.table.clone());
            let columns: BTreeSet<ColumnName> = record
                .id
                .row_key
                .column_names()
                .map(str::to_string)
                .collect();
            let sets = per_table.entry(key).or_default();
            if !sets.contains(&columns) {
                sets.push(columns);
            }
        }
        Self { per_table }
    }

    /// Row ids under which the CVR may currently hold this row, for key
    /// column sets other than the one of `new_id`. Fails when an old key
    /// column is absent from the row, which indicates a stale CVR.
    pub fn old_row_ids(
        &self,
        new_id: &RowId,
        row: &RowValue,
    ) -> Result<Vec<RowId>, KeyColumnsError> {
        let Some(sets) = self
            .per_table
            .get(&(new_id.schema.clone(), new_id.table.clone()))
        else {
            return Ok(Vec::new());
        };
        let new_columns: BTreeSet<ColumnName> = new_id
            .row_key
            .column_names()
            .map(str::to_string)
            .collect();

        let mut old_ids = Vec::new();
        for set in sets {
            if *set == new_columns {
                continue;
            }
            let mut key = RowValue::new();
            for column in set {
                let value = row.get(column).ok_or_else(|| KeyColumnsError::StaleClientView {
                    table: new_id.table.clone(),
                    column: column.clone(),
                })?;
                key.insert(column.clone(), value.clone());
            }
            let row_key = RowKey::new(key).map_err(|e| KeyColumnsError::Key(e.to_string()))?;
            old_ids.push(RowId::new(new_id.schema.clone(), new_id.table.clone(), row_key));
        }
        Ok(old_ids)
    }
}
