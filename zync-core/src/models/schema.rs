//! Replica and client schema descriptions.
//!
//! Tables are kept in a flat registry keyed by name; relationships in
//! queries refer to destination tables by name and are resolved by lookup.

use crate::models::{ColumnName, SchemaName, TableName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum SchemaError {
    #[error("unknown table `{0}`, available tables: {1:?}")]
    UnknownTable(TableName, Vec<TableName>),
    #[error("table `{0}` does not replicate columns {1:?}")]
    UnknownColumns(TableName, Vec<ColumnName>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Text,
    Int,
    Float,
    Bool,
    Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    pub data_type: ValueType,
    #[serde(default)]
    pub not_null: bool,
}

/// Description of one replicated table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    #[serde(default = "super::query::default_schema")]
    pub schema: SchemaName,
    pub name: TableName,
    pub columns: BTreeMap<ColumnName, ColumnSpec>,
    pub primary_key: Vec<ColumnName>,
    /// Column sets of all unique indexes, primary key excluded.
    #[serde(default)]
    pub unique_indexes: Vec<Vec<ColumnName>>,
}

impl TableSpec {
    /// The union key: all columns participating in any unique index of the
    /// table. Stable row identifier across primary key changes.
    pub fn union_key_columns(&self) -> BTreeSet<ColumnName> {
        self.primary_key
            .iter()
            .chain(self.unique_indexes.iter().flatten())
            .cloned()
            .collect()
    }
}

/// The column subset a client declares interest in, per table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSchema {
    pub tables: BTreeMap<TableName, ClientTableSchema>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTableSchema {
    pub columns: BTreeSet<ColumnName>,
    /// Server-side name when the client uses a mapped name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<TableName>,
    /// Client-to-server column name mappings, for columns whose client
    /// name differs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub column_names: BTreeMap<ColumnName, ColumnName>,
}

impl ClientSchema {
    /// Resolves the server-side name for a client table name.
    pub fn server_table_name<'a>(&'a self, client_name: &'a str) -> &'a str {
        self.tables
            .get(client_name)
            .and_then(|t| t.server_name.as_deref())
            .unwrap_or(client_name)
    }

    /// Resolves the server-side name for a column of a client table.
    pub fn server_column_name<'a>(&'a self, client_table: &str, client_column: &'a str) -> &'a str {
        self.tables
            .get(client_table)
            .and_then(|t| t.column_names.get(client_column))
            .map(String::as_str)
            .unwrap_or(client_column)
    }

    /// Validates that this schema is a subset of the replicated tables and
    /// columns.
    pub fn validate_against(
        &self,
        replicated: &BTreeMap<TableName, TableSpec>,
    ) -> Result<(), SchemaError> {
        for (client_name, table) in &self.tables {
            let server_name = self.server_table_name(client_name);
            let spec = replicated.get(server_name).ok_or_else(|| {
                SchemaError::UnknownTable(
                    server_name.to_string(),
                    replicated.keys().cloned().collect(),
                )
            })?;
            let missing: Vec<ColumnName> = table
                .columns
                .iter()
                .map(|c| self.server_column_name(client_name, c).to_string())
                .filter(|c| !spec.columns.contains_key(c))
                .collect();
            if !missing.is_empty() {
                return Err(SchemaError::UnknownColumns(server_name.to_string(), missing));
            }
        }
        Ok(())
    }
}

/// Range of client schema versions a replica can serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersions {
    pub min_supported_version: u32,
    pub max_supported_version: u32,
}

impl SchemaVersions {
    pub fn supports(&self, version: u32) -> bool {
        (self.min_supported_version..=self.max_supported_version).contains(&version)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

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

    #[test]
    fn test_union_key_is_union_of_unique_indexes() {
        let key: Vec<_> = users_spec().union_key_columns().into_iter().collect();
        assert_eq!(key, vec!["id", "login"]);
    }

    #[test]
    fn test_client_schema_subset_validation() {
        let replicated: BTreeMap<_, _> = [("users".to_string(), users_spec())].into();

        let mut schema = ClientSchema::default();
        schema.tables.insert(
            "users".to_string(),
            ClientTableSchema {
                columns: ["id".to_string(), "name".to_string()].into(),
                server_name: None,
                column_names: BTreeMap::new(),
            },
        );
        schema.validate_against(&replicated).unwrap();

        schema
            .tables
            .get_mut("users")
            .unwrap()
            .columns
            .insert("phone".to_string());
        assert_eq!(
            schema.validate_against(&replicated),
            Err(SchemaError::UnknownColumns("users".to_string(), vec!["phone".to_string()]))
        );

        let mut unknown = ClientSchema::default();
        unknown
            .tables
            .insert("missing".to_string(), ClientTableSchema::default());
        assert!(matches!(
            unknown.validate_against(&replicated),
            Err(SchemaError::UnknownTable(t, _)) if t == "missing"
        ));
    }

    #[test]
    fn test_schema_versions_range() {
        let versions = SchemaVersions { min_supported_version: 2, max_supported_version: 3 };
        assert!(!versions.supports(1));
        assert!(versions.supports(2));
        assert!(versions.supports(3));
        assert!(!versions.supports(4));
    }
}
