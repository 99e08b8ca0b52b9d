//! Row identity and row records.
//!
//! A row is identified by `{schema, table, rowKey}` where the row key is
//! the canonical JSON of the table's union key: the union of all unique
//! index column sets. The union key keeps old and new identities
//! referenceable across primary key changes until catch-up completes.

use crate::json::{canonical_string, JsonError};
use crate::models::version::CvrVersion;
use crate::models::{QueryHash, SchemaName, TableName};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Row values are JSON objects; `serde_json`'s default map keeps keys
/// sorted which matches the canonical form used everywhere else.
pub type RowValue = Map<String, Value>;

/// Canonically serialized key columns of a row.
///
/// Equality, ordering and hashing are all defined over the canonical
/// string, so keys behave identically in maps, on the wire and in JSONB
/// columns.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct RowKey {
    columns: Map<String, Value>,
    canonical: String,
}

impl RowKey {
    pub fn new(columns: Map<String, Value>) -> Result<Self, JsonError> {
        let canonical = canonical_string(&columns)?;
        Ok(Self { columns, canonical })
    }

    pub fn columns(&self) -> &Map<String, Value> {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn into_columns(self) -> Map<String, Value> {
        self.columns
    }
}

impl TryFrom<Map<String, Value>> for RowKey {
    type Error = JsonError;

    fn try_from(columns: Map<String, Value>) -> Result<Self, Self::Error> {
        Self::new(columns)
    }
}

impl From<RowKey> for Map<String, Value> {
    fn from(key: RowKey) -> Self {
        key.columns
    }
}

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for RowKey {}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl Hash for RowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

/// Full identity of a row within a client group's view.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowId {
    pub schema: SchemaName,
    pub table: TableName,
    pub row_key: RowKey,
}

impl RowId {
    pub fn new(schema: impl Into<SchemaName>, table: impl Into<TableName>, row_key: RowKey) -> Self {
        Self { schema: schema.into(), table: table.into(), row_key }
    }
}

/// Reference counts per query hash. A row is live in the CVR iff the map
/// is non-empty; `None` denotes a tombstone that lagging clients may still
/// need to receive as a delete.
pub type RefCounts = BTreeMap<QueryHash, i32>;

/// Persisted per-row CVR state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRecord {
    pub id: RowId,
    /// Replica-assigned per-row version, used for change detection only.
    pub row_version: String,
    /// CVR version at which this record was last updated.
    pub patch_version: CvrVersion,
    pub ref_counts: Option<RefCounts>,
}

impl RowRecord {
    pub fn is_tombstone(&self) -> bool {
        self.ref_counts.is_none()
    }

    /// Applies a refcount delta for `hash`. Drops hashes whose count
    /// reaches zero; transitions to a tombstone when the last hash drops.
    pub fn apply_ref_count(&mut self, hash: &QueryHash, delta: i32) {
        let counts = self.ref_counts.get_or_insert_with(BTreeMap::new);
        let count = counts.entry(hash.clone()).or_insert(0);
        *count += delta;
        if *count <= 0 {
            counts.remove(hash);
        }
        if counts.is_empty() {
            self.ref_counts = None;
        }
    }
}
